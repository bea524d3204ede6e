use anyhow::Result;
use registry_mirror::{
    init_tracing, EnvOverrides, RegistryClientOptions, RegistryConnector, RegistryMirrorFactory,
    RunConfig, RunController, Runner,
};
use std::sync::Arc;

#[tokio::main]
async fn main() -> Result<()> {
    let env = EnvOverrides::from_env();
    init_tracing(env.log_level.as_deref())?;

    let path = env.config_path();
    tracing::info!(path = %path.display(), "reading config");
    let config = Arc::new(RunConfig::load(&env)?);
    tracing::info!(
        workers = config.workers(),
        repositories = config.repositories().len(),
        target = config.target_registry(),
        "config loaded"
    );

    let controller = RunController::new(
        config,
        Arc::new(RegistryConnector::new(RegistryClientOptions::default())),
        Arc::new(RegistryMirrorFactory),
    );
    let runner = Runner::new(Arc::new(controller));
    runner.run_until_ctrl_c().await
}
