use crate::agent::LocalRelayAgent;
use crate::clock::RealClock;
use crate::config::Config;
use crate::error::Error;
use crate::observer::{self, State};
use crate::router;
use crate::store::ObjectStore;
use crate::store::kubernetes::KubeStore;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::info;

pub struct TrellisServer {
    pub state: State,
    pub addr: SocketAddr,
    pub listener: tokio::net::TcpListener,
    pub router: axum::Router,
    pub store: Arc<dyn ObjectStore>,
    pub config: Config,
}

impl TrellisServer {
    pub async fn new(config: Config) -> Result<Self, Error> {
        let store = KubeStore::try_default()
            .await
            .map_err(|e| Error::Config(format!("failed to create kubernetes client: {e}")))?;
        Self::new_with_store(config, Arc::new(store)).await
    }

    pub async fn new_with_store(config: Config, store: Arc<dyn ObjectStore>) -> Result<Self, Error> {
        let state = State::default();
        let router = router::new_router(state.clone());
        let listener = tokio::net::TcpListener::bind(&config.bind_addr).await?;
        let addr = listener.local_addr()?;

        Ok(TrellisServer {
            state,
            addr,
            listener,
            router,
            store,
            config,
        })
    }

    pub async fn serve(self) -> Result<(), Error> {
        let namespace = self.config.namespace.clone();

        let observer_state = self.state.clone();
        let observer_store = self.store.clone();
        let observer_namespace = namespace.clone();
        let _observer_handle = tokio::spawn(async move {
            info!("Starting observer...");
            observer::run(observer_state, observer_store, observer_namespace).await;
            info!("Observer finished");
        });

        if let Some(bucket_dir) = self.config.bucket_dir.clone() {
            let agent =
                LocalRelayAgent::new(self.store.clone(), Arc::new(RealClock), namespace, bucket_dir);
            let _agent_handle = tokio::spawn(agent.run());
        }

        info!(addr = %self.addr, "serving lifecycle status");
        axum::serve(self.listener, self.router).await?;
        Ok(())
    }
}
