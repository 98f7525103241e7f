use anyhow::{bail, Context as _};
use clap::{Parser, Subcommand};
use futures_util::StreamExt;
use k8s_openapi::api::{
  core::v1::ServiceAccount,
  rbac::v1::{Role, RoleBinding},
};
use kube::{
  api::{Api, ListParams},
  runtime::{watcher, WatchStreamExt},
  Client, CustomResourceExt, Resource,
};
use log::{debug, error, info, warn};
use serde::de::DeserializeOwned;
use std::{fmt::Debug, path::PathBuf, sync::Arc};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use operator::{
  audit::AuditLog,
  cluster::KubeClient,
  config::Config,
  desired::DesiredState,
  engine::Engine,
  iam::AwsIam,
  model::{Action, Outcome},
  rbac::{MANAGED_BY_LABEL, MANAGED_BY_VALUE},
  retry::RetryLedger,
  store::MappingStore,
  IrsaBinding,
};

#[derive(Parser, Debug)]
#[command(name = "operator", version, about, long_about = None)]
struct Cli {
  #[command(subcommand)]
  command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Print the IrsaBinding CustomResourceDefinition as YAML
  Crd,
  /// Reconcile continuously (the default)
  Run {
    /// Desired state file; IrsaBindings are read from the cluster when unset
    #[arg(long, env = "IRSA_DESIRED_STATE")]
    desired_state: Option<PathBuf>,
  },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
  env_logger::init();

  let cli_desired_state = match Cli::parse().command {
    Some(Command::Crd) => {
      print!("{}", serde_yaml::to_string(&IrsaBinding::crd())?);
      return Ok(());
    }
    Some(Command::Run { desired_state }) => desired_state,
    None => None,
  };

  let mut config = Config::from_env().context("Invalid configuration")?;
  if cli_desired_state.is_some() {
    config.desired_state = cli_desired_state;
  }
  let client = kube_client().await?;
  let aws = aws_config::load_defaults(aws_config::BehaviorVersion::latest()).await;

  let mut engine = Engine::new(
    Arc::new(KubeClient::new(client.clone())),
    Arc::new(AwsIam::new(aws_sdk_iam::Client::new(&aws))),
    config.engine.clone(),
  );
  if let Some(path) = &config.store_path {
    engine = engine.with_store(MappingStore::open(path).context("Failed to open mapping store")?);
  }
  if let Some(path) = &config.ledger_path {
    let ledger = RetryLedger::open(config.engine.max_attempts, config.engine.backoff.clone(), path)
      .context("Failed to open retry ledger")?;
    engine = engine.with_ledger(ledger);
  }
  if let Some(path) = &config.audit_path {
    engine = engine.with_audit(AuditLog::with_file(path).context("Failed to open audit log")?);
  }

  // every watched change asks for a cycle; one pending request is enough
  let (trigger, mut triggered) = mpsc::channel(1);
  let selector = format!("{}={}", MANAGED_BY_LABEL, MANAGED_BY_VALUE);
  let managed = watcher::Config::default().labels(&selector);
  watch(Api::<ServiceAccount>::all(client.clone()), managed.clone(), trigger.clone());
  watch(Api::<Role>::all(client.clone()), managed.clone(), trigger.clone());
  watch(Api::<RoleBinding>::all(client.clone()), managed, trigger.clone());
  if config.desired_state.is_none() {
    watch(Api::<IrsaBinding>::all(client.clone()), watcher::Config::default(), trigger);
  }

  let shutdown = CancellationToken::new();
  let on_signal = shutdown.clone();
  tokio::spawn(async move {
    if tokio::signal::ctrl_c().await.is_ok() {
      info!("Shutting down, cancelling in-flight work");
      on_signal.cancel();
    }
  });

  let mut resync = tokio::time::interval(config.resync);
  loop {
    tokio::select! {
      _ = shutdown.cancelled() => break,
      _ = resync.tick() => debug!("Periodic resync"),
      Some(()) = triggered.recv() => debug!("Cluster change observed"),
    }

    let desired = match desired_state(&engine, &client, &config).await {
      Ok(d) => d,
      Err(e) => {
        error!("Failed to read desired state: {:?}", e);
        continue;
      }
    };
    match engine.run_cycle(&desired, &shutdown.child_token()).await {
      Ok(report) => info!(
        "Reconciled {} mapping(s): {} patch(es), {} failure(s)",
        desired.mappings.len(),
        report.patches(),
        report.failures()
      ),
      Err(e) => error!("Reconcile failed: {}", e),
    }
  }

  Ok(())
}

async fn kube_client() -> anyhow::Result<Client> {
  // try load from env var which Terraform uses
  match Client::try_default().await {
    Ok(c) => Ok(c),
    _ => {
      use kube::config::KubeConfigOptions;
      use std::convert::TryFrom;

      match std::env::var("KUBE_CTX") {
        Ok(ctx) => Client::try_from(
          kube::Config::from_kubeconfig(&KubeConfigOptions {
            context: Some(ctx),
            ..KubeConfigOptions::default()
          })
          .await?,
        )
        .context("Failed to load KUBE_CTX context"),

        _ => bail!("Failed to create client"),
      }
    }
  }
}

fn watch<K>(api: Api<K>, config: watcher::Config, trigger: mpsc::Sender<()>)
where
  K: Resource + Clone + DeserializeOwned + Debug + Send + 'static,
  K::DynamicType: Default,
{
  let kind = K::kind(&K::DynamicType::default()).to_string();
  tokio::spawn(async move {
    let mut events = watcher(api, config).default_backoff().boxed();
    while let Some(event) = events.next().await {
      match event {
        Ok(_) => {
          debug!("{} changed", kind);
          let _ = trigger.try_send(());
        }
        Err(e) => warn!("Watching {} failed: {}", kind, e),
      }
    }
  });
}

/// The desired state file when configured, otherwise every IrsaBinding in the
/// cluster. Bindings that do not validate are reported and left out.
async fn desired_state(engine: &Engine, client: &Client, config: &Config) -> anyhow::Result<DesiredState> {
  if let Some(path) = &config.desired_state {
    return DesiredState::load(path).with_context(|| format!("Failed to load {}", path.display()));
  }

  let bindings = Api::<IrsaBinding>::all(client.clone())
    .list(&ListParams::default())
    .await
    .context("Failed to list IrsaBindings")?;
  let (desired, rejected) = DesiredState::from_bindings(&bindings.items);
  for (resource, err) in rejected {
    warn!("Ignoring {}: {}", resource, err);
    engine.audit().record(resource, Action::Noop, Outcome::Failed, Some(&err));
  }
  Ok(desired)
}
