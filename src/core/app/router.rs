// src/core/app/router.rs

//! Router Registrar: registers an app's routes with the local router and,
//! when tunneling is enabled, the remote-access manager's tunnel. The actual
//! HTTP/tunnel surface is owned by those external collaborators; this trait
//! only defines the contract the App Lifecycle Manager drives from
//! leadership and lock events.

use async_trait::async_trait;
use tracing::info;

use crate::core::errors::PiccoloError;

#[derive(Debug, Clone)]
pub struct RouteSpec {
    pub app_name: String,
    /// `None` for a tunnel route with no locally bound port.
    pub host_port: Option<u16>,
}

#[async_trait]
pub trait RouterRegistrar: Send + Sync {
    async fn register_local(&self, route: &RouteSpec) -> Result<(), PiccoloError>;
    async fn unregister_local(&self, app_name: &str) -> Result<(), PiccoloError>;
    async fn register_tunnel(&self, route: &RouteSpec) -> Result<(), PiccoloError>;
    async fn unregister_tunnel(&self, app_name: &str) -> Result<(), PiccoloError>;
}

/// A registrar that only logs: the local router and tunnel manager are
/// external collaborators this kernel does not implement. Production wiring
/// swaps this out for a real adapter; this default keeps the App Lifecycle
/// Manager runnable standalone.
#[derive(Default)]
pub struct LoggingRouterRegistrar;

#[async_trait]
impl RouterRegistrar for LoggingRouterRegistrar {
    async fn register_local(&self, route: &RouteSpec) -> Result<(), PiccoloError> {
        info!(app = %route.app_name, port = ?route.host_port, "local route registered");
        Ok(())
    }

    async fn unregister_local(&self, app_name: &str) -> Result<(), PiccoloError> {
        info!(app = %app_name, "local route unregistered");
        Ok(())
    }

    async fn register_tunnel(&self, route: &RouteSpec) -> Result<(), PiccoloError> {
        info!(app = %route.app_name, port = ?route.host_port, "tunnel route registered");
        Ok(())
    }

    async fn unregister_tunnel(&self, app_name: &str) -> Result<(), PiccoloError> {
        info!(app = %app_name, "tunnel route unregistered");
        Ok(())
    }
}
