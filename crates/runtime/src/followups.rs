//! Follow-up scheduler.
//!
//! A single task sleeps until the earliest pending `execute_at`, wakes, and
//! delivers every due follow-up. The Pending→Fired transition happens in
//! the store *before* delivery, so a follow-up fires at most once even if
//! delivery itself fails. Creating or cancelling a follow-up pokes the
//! notify handle so the timer re-arms immediately.

use std::time::Duration;

use hb_store::{FollowUp, SessionFilter, SessionStatus};

use crate::supervisor::{Runtime, SpawnOptions};

/// Upper bound on a single sleep so schedule changes and clock drift are
/// picked up even without a notify.
const MAX_SLEEP: Duration = Duration::from_secs(30);

pub(crate) async fn scheduler_loop(runtime: Runtime) {
    loop {
        let next = runtime
            .inner
            .store
            .next_follow_up_at()
            .await
            .unwrap_or(None);

        let wait = match next {
            None => MAX_SLEEP,
            Some(at) => {
                let now = runtime.inner.clock.now();
                if at <= now {
                    Duration::ZERO
                } else {
                    (at - now).to_std().unwrap_or(Duration::ZERO).min(MAX_SLEEP)
                }
            }
        };

        if wait > Duration::ZERO {
            tokio::select! {
                _ = tokio::time::sleep(wait) => {}
                _ = runtime.inner.followup_notify.notified() => continue,
            }
        }

        let due = runtime.inner.store.due_follow_ups().await.unwrap_or_default();
        let mut fired = 0usize;
        for follow_up in due {
            // At-most-once: claim the transition before delivering.
            match runtime.inner.store.mark_follow_up_fired(&follow_up.id).await {
                Ok(true) => {
                    fired += 1;
                    deliver(&runtime, &follow_up).await;
                }
                Ok(false) => {}
                Err(e) => {
                    tracing::warn!(follow_up_id = %follow_up.id, error = %e, "follow-up fire failed");
                }
            }
        }

        if fired == 0 && wait == Duration::ZERO {
            // A due timestamp with nothing actually firing — back off so a
            // skewed clock cannot spin this loop.
            tokio::time::sleep(Duration::from_millis(500)).await;
        }
    }
}

async fn deliver(runtime: &Runtime, follow_up: &FollowUp) {
    tracing::info!(
        follow_up_id = %follow_up.id,
        agent_id = %follow_up.agent_id,
        "delivering follow-up"
    );

    // 1. The pinned session, if it still accepts messages.
    if let Some(sid) = &follow_up.session_id {
        match runtime.send_message(sid, &follow_up.message).await {
            Ok(()) => return,
            Err(e) => {
                tracing::warn!(
                    follow_up_id = %follow_up.id,
                    session_id = %sid,
                    error = %e,
                    "pinned session refused follow-up; falling back"
                );
            }
        }
    }

    // 2. Any active session of the agent.
    let active = runtime
        .inner
        .store
        .list_sessions(
            &follow_up.agent_id,
            SessionFilter {
                status: Some(SessionStatus::Active),
                limit: Some(1),
            },
        )
        .await
        .unwrap_or_default();
    if let Some(session) = active.first() {
        if runtime
            .send_message(&session.id, &follow_up.message)
            .await
            .is_ok()
        {
            return;
        }
    }

    // 3. A fresh session.
    let agent = {
        let agents = runtime.inner.agents.read();
        agents.get(&follow_up.agent_id).cloned()
    };
    match agent {
        Some(agent) => {
            if let Err(e) = runtime
                .spawn_session(SpawnOptions::new(agent).with_message(follow_up.message.clone()))
                .await
            {
                tracing::warn!(follow_up_id = %follow_up.id, error = %e, "follow-up spawn failed");
            }
        }
        None => {
            tracing::warn!(
                follow_up_id = %follow_up.id,
                agent_id = %follow_up.agent_id,
                "no registered agent config for follow-up delivery"
            );
        }
    }
}
