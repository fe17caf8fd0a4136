//! One-shot mode-change scripts.
//!
//! A [`Script`] is an engine variant for atomic hardware-mode transitions:
//! put the endstation in mounting mode, return to collect mode, restore the
//! beam. Each run acquires the beamline-wide hardware lock for its full
//! duration, serializing mode changes against data collection.
//!
//! Scripts carry an `enabled` gate independent of `busy`. The gate is a
//! level-triggered interlock driven by an external busy signal: disabling a
//! script while it runs does not abort the run, it only blocks new starts.

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use futures::future::BoxFuture;
use serde_json::json;
use tracing::{info, warn};

use crate::beamline::{Beamline, GonioMode};
use crate::engine::{self, Engine, Outcome, Runnable};
use crate::error::BeamlineError;
use crate::signals::{StateObject, Subscription};

/// The body of a script: one atomic transition against the beamline.
pub type ScriptBody =
    Box<dyn Fn(Arc<Beamline>) -> BoxFuture<'static, Result<serde_json::Value>> + Send + Sync>;

/// A one-shot engine wrapping a single hardware transition.
pub struct Script {
    engine: Engine,
    beamline: Arc<Beamline>,
    description: String,
    body: Option<ScriptBody>,
}

impl Script {
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        beamline: Arc<Beamline>,
        body: ScriptBody,
    ) -> Arc<Self> {
        let script = Arc::new(Self {
            engine: Engine::new(name),
            beamline,
            description: description.into(),
            body: Some(body),
        });
        script.engine.state().set_state("enabled", true);
        script
    }

    /// A script without a body. Starting it surfaces a distinct
    /// programming error instead of silently doing nothing.
    pub fn stub(
        name: impl Into<String>,
        description: impl Into<String>,
        beamline: Arc<Beamline>,
    ) -> Arc<Self> {
        let script = Arc::new(Self {
            engine: Engine::new(name),
            beamline,
            description: description.into(),
            body: None,
        });
        script.engine.state().set_state("enabled", true);
        script
    }

    pub fn engine(&self) -> &Engine {
        &self.engine
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn is_enabled(&self) -> bool {
        self.engine.state().get_bool("enabled")
    }

    pub fn enable(&self) {
        self.engine.state().set_state("enabled", true);
    }

    pub fn disable(&self) {
        self.engine.state().set_state("enabled", false);
    }

    /// Launch the script. A no-op (logged) when disabled or already busy.
    pub fn start(self: &Arc<Self>) -> bool {
        if !self.is_enabled() {
            warn!(script = %self.engine.name(), "disabled or busy, start ignored");
            return false;
        }
        engine::start(Arc::clone(self) as Arc<dyn Runnable>)
    }

    /// Block until the script finishes.
    pub async fn wait(&self) {
        self.engine.wait().await;
    }

    /// Drive the enable gate from an external boolean busy signal.
    ///
    /// While `key` reads true on `source`, new starts are blocked; when it
    /// falls, they are allowed again. In-flight runs are never aborted.
    pub fn bind_interlock(self: &Arc<Self>, source: &StateObject, key: &str) -> Subscription {
        let weak = Arc::downgrade(self);
        source.connect(key, move |event| {
            let Some(script) = weak.upgrade() else {
                return;
            };
            if event.value.as_bool().unwrap_or(false) {
                script.disable();
            } else {
                script.enable();
            }
        })
    }
}

#[async_trait]
impl Runnable for Script {
    fn engine(&self) -> &Engine {
        &self.engine
    }

    async fn run(self: Arc<Self>) -> Result<Outcome> {
        let Some(body) = &self.body else {
            return Err(BeamlineError::NotImplemented(self.engine.name().to_string()).into());
        };
        // Mode changes hold the hardware lock for their entire duration.
        let _hardware = self.beamline.lock.lock().await;
        self.engine
            .state()
            .set_state("message", self.description.clone());
        let output = body(Arc::clone(&self.beamline)).await?;
        info!(script = %self.engine.name(), "script completed");
        self.engine.state().set_state("message", "Done.");
        Ok(Outcome::Done(output))
    }
}

/// Prepare the endstation for sample exchange.
pub fn mount_mode(beamline: Arc<Beamline>) -> Arc<Script> {
    Script::new(
        "SetMountMode",
        "Prepare endstation for sample mounting",
        beamline,
        Box::new(|beamline| {
            Box::pin(async move {
                beamline.fast_shutter.close().await?;
                beamline.detector.set_cover(false).await?;
                beamline.goniometer.set_mode(GonioMode::Mount, true).await?;
                Ok(json!({ "mode": GonioMode::Mount }))
            })
        }),
    )
}

/// Prepare the endstation for optical centering.
pub fn center_mode(beamline: Arc<Beamline>) -> Arc<Script> {
    Script::new(
        "SetCenteringMode",
        "Prepare endstation for sample centering",
        beamline,
        Box::new(|beamline| {
            Box::pin(async move {
                beamline.fast_shutter.close().await?;
                beamline.goniometer.set_mode(GonioMode::Center, true).await?;
                Ok(json!({ "mode": GonioMode::Center }))
            })
        }),
    )
}

/// Prepare the endstation for data collection.
pub fn collect_mode(beamline: Arc<Beamline>) -> Arc<Script> {
    Script::new(
        "SetCollectMode",
        "Prepare endstation for data collection",
        beamline,
        Box::new(|beamline| {
            Box::pin(async move {
                beamline.detector.set_cover(true).await?;
                beamline.goniometer.set_mode(GonioMode::Collect, true).await?;
                Ok(json!({ "mode": GonioMode::Collect }))
            })
        }),
    )
}

/// Remove attenuation after a beam trip so acquisition can restart.
pub fn restore_beam(beamline: Arc<Beamline>) -> Arc<Script> {
    Script::new(
        "RestoreBeam",
        "Restore beam delivery to the endstation",
        beamline,
        Box::new(|beamline| {
            Box::pin(async move {
                beamline.fast_shutter.close().await?;
                beamline.attenuator.move_to(0.0, true).await?;
                Ok(json!({ "attenuation": 0.0 }))
            })
        }),
    )
}

/// The standard set of mode-change scripts for one beamline.
pub fn standard_scripts(beamline: &Arc<Beamline>) -> Vec<Arc<Script>> {
    vec![
        mount_mode(Arc::clone(beamline)),
        center_mode(Arc::clone(beamline)),
        collect_mode(Arc::clone(beamline)),
        restore_beam(Arc::clone(beamline)),
    ]
}
