use crate::{monitor::Connectivity, server::SharedState};
use axum::{
    extract::{Path, State},
    http::StatusCode,
};

/// Lets the host tell the monitor that its network went away or came back.
pub async fn connectivity_changed(
    State(state): State<SharedState>,
    Path(connectivity): Path<String>,
) -> StatusCode {
    let event = match connectivity.as_str() {
        "online" => Connectivity::Online,
        "offline" => Connectivity::Offline,
        _ => return StatusCode::NOT_FOUND,
    };
    if state.monitor.notify_connectivity(event) {
        StatusCode::ACCEPTED
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    }
}
