//! Bot activity gateway.
//!
//! Receives chat-platform activities over HTTP, admits them per tenant, keeps short-lived
//! per-conversation state and forwards every accepted activity to the message broker.
pub mod bot;
pub mod config;
pub mod context;
pub mod http;
pub mod manager;
mod main_logic;
pub mod oauth;
pub mod ordering;
pub mod shutdown;

pub use bot::{BotLogic, BotState, ForwardingBot, Step};
pub use config::{ConfigError, GatewayConfig, OAuthSettings, StoreBackendKind};
pub use context::GatewayContext;
pub use http::{GatewayError, GatewayState, router};
pub use main_logic::{run, serve_until};
pub use manager::{ActivityHandler, ActivityOutcome, BotManager, ManagerError};
pub use oauth::{
    CredentialRef, DisabledTokenExchanger, HttpTokenExchanger, OAuthCallback, TokenExchanger,
    TokenGrant, decode_state, encode_state,
};
pub use shutdown::{ShutdownCoordinator, ShutdownOutcome, ShutdownReport, install_signal_handler};
