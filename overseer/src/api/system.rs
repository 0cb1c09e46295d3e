//! Host resource summary for the dashboard

use std::time::Duration;

use axum::Json;

use crate::actors::process_supervisor::sampler::{CpuTimes, HostSample};

/// Window over which host CPU usage is measured.
const CPU_WINDOW: Duration = Duration::from_millis(250);

pub async fn get_system() -> Json<HostSample> {
    let before = CpuTimes::read();
    tokio::time::sleep(CPU_WINDOW).await;
    let after = CpuTimes::read();
    Json(HostSample::collect(before, after))
}
