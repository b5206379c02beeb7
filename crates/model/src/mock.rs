//! Scripted mock client for tests.
//!
//! Each call to [`ScriptedClient::call`] pops the next delta script from the
//! front of the queue, so tests specify exact event sequences — including
//! tool calls — without network access.

use std::sync::Arc;

use async_trait::async_trait;
use futures_util::stream;
use parking_lot::Mutex;

use hb_domain::{CancelToken, Error, ModelDelta, Result, StopReason};

use crate::{DeltaStream, ModelClient, ModelRequest};

pub struct ScriptedClient {
    scripts: Mutex<Vec<Vec<ModelDelta>>>,
    /// The last request seen, for assertions on what was sent.
    pub last_request: Arc<Mutex<Option<ModelRequest>>>,
}

impl ScriptedClient {
    pub fn new(scripts: Vec<Vec<ModelDelta>>) -> Self {
        Self {
            scripts: Mutex::new(scripts),
            last_request: Arc::new(Mutex::new(None)),
        }
    }

    /// Script builder: a plain text answer ending the turn.
    pub fn text_turn(text: &str) -> Vec<ModelDelta> {
        vec![
            ModelDelta::TextDelta { text: text.into() },
            ModelDelta::Usage {
                input_tokens: 10,
                output_tokens: 10,
            },
            ModelDelta::Stop {
                reason: StopReason::EndTurn,
            },
        ]
    }

    /// Script builder: a single tool invocation.
    pub fn tool_turn(id: &str, name: &str, input: serde_json::Value) -> Vec<ModelDelta> {
        vec![
            ModelDelta::ToolUseStart {
                id: id.into(),
                name: name.into(),
            },
            ModelDelta::ToolUseInputDelta {
                id: id.into(),
                partial: input.to_string(),
            },
            ModelDelta::ToolUseEnd {
                id: id.into(),
                input,
            },
            ModelDelta::Usage {
                input_tokens: 10,
                output_tokens: 5,
            },
            ModelDelta::Stop {
                reason: StopReason::ToolUse,
            },
        ]
    }

    /// Number of scripts not yet consumed.
    pub fn remaining(&self) -> usize {
        self.scripts.lock().len()
    }
}

#[async_trait]
impl ModelClient for ScriptedClient {
    async fn call(&self, req: ModelRequest, _cancel: CancelToken) -> Result<DeltaStream> {
        *self.last_request.lock() = Some(req);
        let script = {
            let mut scripts = self.scripts.lock();
            if scripts.is_empty() {
                return Err(Error::PermanentUpstream(
                    "scripted client exhausted".into(),
                ));
            }
            scripts.remove(0)
        };
        let items: Vec<Result<ModelDelta>> = script.into_iter().map(Ok).collect();
        Ok(Box::pin(stream::iter(items)))
    }

    fn provider_id(&self) -> &str {
        "mock"
    }
}
