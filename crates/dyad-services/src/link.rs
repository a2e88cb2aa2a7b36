//! Both channels of one peer, bound from config and closed together.

use std::sync::Arc;

use tokio::sync::broadcast;

use dyad_core::config::DyadConfig;

use crate::control::ControlChannel;
use crate::coordinator::{StageCoordinator, Station};
use crate::error::NetError;
use crate::gaze::GazeChannel;
use crate::session::SessionContext;

pub struct PeerLink {
    pub ctx: Arc<SessionContext>,
    pub control: Arc<ControlChannel>,
    pub gaze: Arc<GazeChannel>,
}

impl PeerLink {
    /// Bind the control and gaze channels for the configured role.
    pub fn bind(config: &DyadConfig) -> Result<Self, NetError> {
        let ctx = Arc::new(SessionContext::new(
            config.session.role,
            config.timing.stale_after(),
        ));
        let network = &config.network;
        let control = ControlChannel::bind(
            network.control_local(),
            network.control_remote(),
            network.socket_buffer_bytes,
            ctx.clone(),
            &config.timing,
        )?;
        let gaze = GazeChannel::from_config(network, ctx.clone(), &config.timing)?;
        Ok(Self {
            ctx,
            control: Arc::new(control),
            gaze: Arc::new(gaze),
        })
    }

    /// A coordinator driving this link.
    pub fn coordinator(
        &self,
        config: &DyadConfig,
        station: Station,
        abort: broadcast::Receiver<()>,
    ) -> StageCoordinator {
        StageCoordinator::new(
            self.ctx.clone(),
            self.control.clone(),
            self.gaze.clone(),
            config,
            station,
            abort,
        )
    }

    pub async fn close(&self) {
        self.gaze.close().await;
        self.control.close().await;
    }
}
