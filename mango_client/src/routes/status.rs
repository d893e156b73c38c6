use crate::{monitor::ServerStatus, server::SharedState};
use axum::{extract::State, response::Json};

pub async fn server_status(State(state): State<SharedState>) -> Json<ServerStatus> {
    Json(state.monitor.status())
}
