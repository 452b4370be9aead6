//! Wallet session lifecycle.
//!
//! A [`WalletConnector`] is the external identity/wallet provider. [`Session`]
//! wraps one and owns the connected/disconnected state and the current
//! [`ChainConfig`], handing out the [`SigningContext`] and broadcasting
//! [`SessionEvent`]s so the payment flow can react to logins, logouts and
//! chain switches.

use std::sync::{Arc, PoisonError, RwLock};

use alloy::network::EthereumWallet;
use alloy::primitives::Address;
use alloy::providers::{
    fillers::{
        BlobGasFiller, ChainIdFiller, FillProvider, GasFiller, JoinFill, NonceFiller, WalletFiller,
    },
    Identity, Provider, ProviderBuilder, RootProvider,
};
use alloy::signers::local::PrivateKeySigner;
use serde::Serialize;
use tokio::sync::{broadcast, Mutex};

use crate::rpc::RpcSigningContext;
use crate::signing::SigningContext;
use crate::{BasePayError, ChainConfig};

/// Capacity of the session event channel. Slow subscribers see `Lagged`.
const EVENT_CAPACITY: usize = 16;

/// Profile details reported by the identity provider.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UserInfo {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub profile_image: Option<String>,
    /// Login method, e.g. `"google"` or `"local-key"`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub verifier: Option<String>,
}

/// What a connector hands back on a successful login.
pub struct Connection<C> {
    pub context: C,
    pub user: UserInfo,
}

/// Session lifecycle transitions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    Connected { address: Address, chain_id: u64 },
    Disconnected,
    ChainChanged { address: Address, chain_id: u64 },
}

/// The external wallet/identity provider.
pub trait WalletConnector: Send + Sync {
    type Context: SigningContext + 'static;

    /// Authenticate and produce a signing context on `config`'s chain.
    fn connect(
        &self,
        config: &ChainConfig,
    ) -> impl std::future::Future<Output = Result<Connection<Self::Context>, BasePayError>> + Send;

    /// End the provider-side session.
    fn disconnect(&self) -> impl std::future::Future<Output = Result<(), BasePayError>> + Send;

    /// Produce a signing context for the same user on another chain.
    fn switch_chain(
        &self,
        config: &ChainConfig,
    ) -> impl std::future::Future<Output = Result<Connection<Self::Context>, BasePayError>> + Send;
}

struct SessionState<C> {
    context: Option<Arc<C>>,
    user: Option<UserInfo>,
    /// Chain the session targets; replaced together with the context.
    config: ChainConfig,
    /// Bumped on every transition so in-flight work can detect it.
    epoch: u64,
}

/// Explicit session object: current signing context, user info, and a
/// broadcast channel of lifecycle events.
pub struct Session<W: WalletConnector> {
    connector: W,
    state: RwLock<SessionState<W::Context>>,
    events: broadcast::Sender<SessionEvent>,
    /// Serializes connect/disconnect/switch.
    lifecycle: Mutex<()>,
}

impl<W: WalletConnector> Session<W> {
    /// A disconnected session that will connect to `config`'s chain.
    pub fn new(connector: W, config: ChainConfig) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            connector,
            state: RwLock::new(SessionState {
                context: None,
                user: None,
                config,
                epoch: 0,
            }),
            events,
            lifecycle: Mutex::new(()),
        }
    }

    /// Connect through the wallet provider. Returns the existing context if
    /// already connected.
    pub async fn connect(&self) -> Result<Arc<W::Context>, BasePayError> {
        let _guard = self.lifecycle.lock().await;
        if let Some(context) = self.signing_context() {
            return Ok(context);
        }

        let config = self.chain_config();
        let connection = self.connector.connect(&config).await?;
        let context = self.install(connection, config)?;
        tracing::info!(
            address = %context.address(),
            chain_id = context.chain_id(),
            "wallet connected"
        );
        let _ = self.events.send(SessionEvent::Connected {
            address: context.address(),
            chain_id: context.chain_id(),
        });
        Ok(context)
    }

    /// Disconnect. Local state is cleared even if the provider reports an
    /// error, which is then returned.
    pub async fn disconnect(&self) -> Result<(), BasePayError> {
        let _guard = self.lifecycle.lock().await;
        if !self.is_connected() {
            return Ok(());
        }

        let result = self.connector.disconnect().await;
        if let Err(e) = &result {
            tracing::warn!(error = %e, "wallet provider disconnect failed; clearing session anyway");
        }

        {
            let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
            state.context = None;
            state.user = None;
            state.epoch += 1;
        }
        tracing::info!("wallet disconnected");
        let _ = self.events.send(SessionEvent::Disconnected);
        result
    }

    /// Move the connected user to another chain.
    pub async fn switch_chain(&self, config: &ChainConfig) -> Result<Arc<W::Context>, BasePayError> {
        let _guard = self.lifecycle.lock().await;
        if !self.is_connected() {
            return Err(BasePayError::NotConnected);
        }

        let connection = self.connector.switch_chain(config).await?;
        let context = self.install(connection, config.clone())?;
        tracing::info!(
            chain = %config.display_name,
            chain_id = context.chain_id(),
            "switched chain"
        );
        let _ = self.events.send(SessionEvent::ChainChanged {
            address: context.address(),
            chain_id: context.chain_id(),
        });
        Ok(context)
    }

    /// Swap in a new context and its chain config in one step, so readers
    /// never see one without the other.
    fn install(
        &self,
        connection: Connection<W::Context>,
        config: ChainConfig,
    ) -> Result<Arc<W::Context>, BasePayError> {
        let actual = connection.context.chain_id();
        if actual != config.chain_id {
            tracing::warn!(
                expected = config.chain_id,
                actual,
                "connector returned a context on the wrong chain"
            );
            return Err(BasePayError::ChainMismatch {
                expected: config.chain_id,
                actual,
            });
        }

        let context = Arc::new(connection.context);
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        state.context = Some(Arc::clone(&context));
        state.user = Some(connection.user);
        state.config = config;
        state.epoch += 1;
        Ok(context)
    }

    pub fn is_connected(&self) -> bool {
        self.state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .context
            .is_some()
    }

    pub fn signing_context(&self) -> Option<Arc<W::Context>> {
        self.state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .context
            .clone()
    }

    pub fn user_info(&self) -> Option<UserInfo> {
        self.state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .user
            .clone()
    }

    /// The chain the session is on, or will connect to.
    pub fn chain_config(&self) -> ChainConfig {
        self.state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .config
            .clone()
    }

    pub fn address(&self) -> Option<Address> {
        self.signing_context().map(|context| context.address())
    }

    /// Current lifecycle epoch. Changes on every connect, disconnect and switch.
    pub fn epoch(&self) -> u64 {
        self.state.read().unwrap_or_else(PoisonError::into_inner).epoch
    }

    /// The signing context, provided the session has not changed since `epoch`.
    pub fn context_for(&self, epoch: u64) -> Result<Arc<W::Context>, BasePayError> {
        let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
        match &state.context {
            Some(context) if state.epoch == epoch => Ok(Arc::clone(context)),
            _ => Err(BasePayError::NotConnected),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }
}

/// Concrete provider type from `ProviderBuilder::new().wallet(...).connect_http(...)`.
pub type WalletProvider = FillProvider<
    JoinFill<
        JoinFill<
            Identity,
            JoinFill<GasFiller, JoinFill<BlobGasFiller, JoinFill<NonceFiller, ChainIdFiller>>>,
        >,
        WalletFiller<EthereumWallet>,
    >,
    RootProvider,
>;

/// Wallet connector backed by a local private key, for scripts and testnet demos.
pub struct LocalKeyConnector {
    signer: PrivateKeySigner,
}

impl LocalKeyConnector {
    /// Create a connector from a hex-encoded private key (with or without 0x prefix).
    pub fn new(private_key: &str) -> Result<Self, BasePayError> {
        let key = private_key.strip_prefix("0x").unwrap_or(private_key);
        let signer: PrivateKeySigner = key
            .parse()
            .map_err(|e| BasePayError::ConfigError(format!("invalid private key: {e}")))?;
        Ok(Self { signer })
    }

    pub fn address(&self) -> Address {
        self.signer.address()
    }

    async fn open(
        &self,
        config: &ChainConfig,
    ) -> Result<Connection<RpcSigningContext<WalletProvider>>, BasePayError> {
        let rpc_url = config.rpc_url.parse().map_err(|e| {
            BasePayError::ConfigError(format!("invalid rpc url '{}': {e}", config.rpc_url))
        })?;
        let provider = ProviderBuilder::new()
            .wallet(EthereumWallet::from(self.signer.clone()))
            .connect_http(rpc_url);

        let chain_id = provider
            .get_chain_id()
            .await
            .map_err(|e| BasePayError::Transport(format!("eth_chainId failed: {e}")))?;
        if chain_id != config.chain_id {
            return Err(BasePayError::ConfigError(format!(
                "{} serves chain {chain_id}, expected {}",
                config.rpc_url, config.chain_id
            )));
        }

        Ok(Connection {
            context: RpcSigningContext::new(provider, self.signer.address(), chain_id),
            user: UserInfo {
                name: Some(format!("{}", self.signer.address())),
                verifier: Some("local-key".to_string()),
                ..UserInfo::default()
            },
        })
    }
}

impl WalletConnector for LocalKeyConnector {
    type Context = RpcSigningContext<WalletProvider>;

    async fn connect(&self, config: &ChainConfig) -> Result<Connection<Self::Context>, BasePayError> {
        self.open(config).await
    }

    async fn disconnect(&self) -> Result<(), BasePayError> {
        Ok(())
    }

    async fn switch_chain(
        &self,
        config: &ChainConfig,
    ) -> Result<Connection<Self::Context>, BasePayError> {
        self.open(config).await
    }
}
