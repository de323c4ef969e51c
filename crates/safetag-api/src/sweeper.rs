use std::time::Duration;

use chrono::Utc;
use tracing::{info, warn};

use safetag_types::events::RoomEvent;

use crate::calls::announce;
use crate::convert;
use crate::error::AppError;
use crate::state::AppState;

/// What one sweep changed.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub expired_qrs: usize,
    pub closed_sessions: usize,
    pub missed_calls: usize,
}

/// Background task that applies time-based transitions: lapsed QR codes
/// expire, idle chat sessions close and unanswered calls become missed.
pub async fn run_sweeper(state: AppState, interval_secs: u64) {
    let mut interval = tokio::time::interval(Duration::from_secs(interval_secs));

    loop {
        interval.tick().await;

        match sweep(&state).await {
            Ok(report) => {
                if report != SweepReport::default() {
                    info!(
                        "Sweep: {} QR codes expired, {} sessions closed, {} calls missed",
                        report.expired_qrs, report.closed_sessions, report.missed_calls
                    );
                }
            }
            Err(e) => {
                warn!("Sweep error: {:#}", e);
            }
        }
    }
}

pub async fn sweep(state: &AppState) -> anyhow::Result<SweepReport> {
    let idle_before = Utc::now() - chrono::Duration::hours(state.settings.session_idle_hours);
    let ring_before = Utc::now() - chrono::Duration::seconds(state.settings.ring_timeout_secs);

    let (expired_qrs, closed, missed) = state
        .store(move |db| {
            let expired = db.expire_qr_codes()?;
            let closed = db.close_idle_sessions(idle_before)?;
            let missed = db.time_out_ringing_calls(ring_before)?;
            Ok((expired, closed, missed))
        })
        .await
        .map_err(|e| match e {
            AppError::Upstream(cause) => cause,
            other => anyhow::anyhow!(other.to_string()),
        })?;

    for session in &closed {
        let session_id = convert::id(&session.id)?;
        state.rooms.emit(&session.id, &RoomEvent::SessionClosed { session_id }).await;
    }
    for call in &missed {
        if let Err(e) = announce(state, call, RoomEvent::CallMissed).await {
            warn!("Could not announce missed call {}: {}", call.id, e);
        }
    }

    Ok(SweepReport {
        expired_qrs,
        closed_sessions: closed.len(),
        missed_calls: missed.len(),
    })
}
