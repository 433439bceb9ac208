//! `vahti` - poll the controller and feed Grafana and Prometheus until signalled

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    vahti_runtime::run(|bridge| async move { Ok(bridge) }).await
}
