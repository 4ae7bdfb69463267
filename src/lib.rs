//! Declarative instrument drivers.
//!
//! A driver class is declared once as a [`ClassBody`]: features (instrument
//! properties mapped to commands), actions (instrument methods), nested
//! subsystems and repeated channels. Building the body produces a
//! [`DriverClass`] whose members carry composed get/set/call pipelines, and a
//! [`Driver`] runs those pipelines against a [`Backend`] with caching,
//! retries, unit conversion, limits and enabling checks.
//!
//! Derived classes reuse a base class and edit the inherited pipelines
//! stage by stage (`prepend`, `append`, `add_before`, `add_after`,
//! `replace`) without touching the base.
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use daq_features::prelude::*;
//!
//! let class = ClassBody::new("Lockin")
//!     .version("1.0")
//!     .feature("freq", features::float().getter("FREQ?").setter("FREQ {}").unit("Hz"))
//!     .build()?;
//! let driver = Driver::new(class, Arc::new(backend), DriverConfig::default())?;
//! driver.set("freq", 100.0)?;
//! ```

pub mod actions;
pub mod backend;
pub mod checks;
pub mod class;
pub mod composition;
pub mod config;
pub mod declarative;
pub mod driver;
pub mod error;
pub mod features;
pub mod limits;
pub mod logging;
pub mod unit;
pub mod value;

pub use backend::Backend;
pub use class::{DriverClass, Subpart};
pub use config::DriverConfig;
pub use declarative::{Available, ClassBody, Declare, SubpartDecl};
pub use driver::{CacheSnapshot, ChannelContainer, Driver, DriverRegistry, Node};
pub use error::{CommErrorKind, DaqError, DaqResult};
pub use unit::{Quantity, Unit};
pub use value::{ChannelId, RegisterValue, Value};

/// Everything needed to declare and drive an instrument.
pub mod prelude {
    pub use crate::actions::{self, action, register_action, ActionKwargs, Args, BoundArgs};
    pub use crate::backend::{Backend, MessageBackend, MockBackend, Transport};
    pub use crate::composition::Specifier;
    pub use crate::config::DriverConfig;
    pub use crate::declarative::{Available, ClassBody, Declare};
    pub use crate::driver::{Driver, DriverRegistry, Node};
    pub use crate::error::{CommErrorKind, DaqError, DaqResult};
    pub use crate::features::{self, FeatureKwargs};
    pub use crate::limits::LimitsValidator;
    pub use crate::unit::Quantity;
    pub use crate::value::{ChannelId, Value};
}
