//! Train Real-time Data Protocol (IEC 61375-2-3).
//!
//! Two message classes ride the train backbone: **process data** (cyclic,
//! best-effort publish/subscribe telegrams) and **message data**
//! (transactional Notify/Request/Reply/Confirm exchanges). This crate
//! implements both on a single cooperative [`Session`]: the application
//! calls `publish`/`subscribe`/`send_request` once and then ticks
//! [`Session::process`] from its own loop, blocking between ticks with
//! [`Session::wait`].
//!
//! ```no_run
//! use trdp::{Session, SessionConfig};
//! use std::time::{Duration, Instant};
//!
//! let mut session = Session::open(SessionConfig::default())?;
//! loop {
//!     session.process(Instant::now())?;
//!     session.wait(Duration::from_millis(100))?;
//! }
//! # #[allow(unreachable_code)]
//! # Ok::<(), trdp::TrdpError>(())
//! ```
//!
//! Payload layout is described by a runtime [dictionary](dict::Dictionary)
//! of datasets; the [marshaller](marshal) translates between host-endian
//! application structs and the packed big-endian wire representation.

pub mod config;
pub mod dict;
pub mod error;
pub mod marshal;
pub mod md;
pub mod net;
pub mod pd;
pub mod pool;
pub mod session;
pub mod stats;
pub mod wire;

mod slots;

pub use crate::config::{SessionConfig, TelegramFlags, TimeoutBehavior};
pub use crate::error::{ErrorKind, Result, TrdpError};
pub use crate::md::{
    ListenerHandle, ListenerParams, MdCallback, MdEvent, MdHandle, NotifyParams, RequestParams,
};
pub use crate::pd::{
    PdCallback, PdEvent, PubHandle, PublishParams, PullParams, SubHandle, SubscribeParams,
};
pub use crate::session::Session;
pub use crate::stats::Statistics;
pub use crate::wire::header::MsgType;

/// Default process-data UDP port.
pub const PD_PORT: u16 = config::DEFAULT_PD_PORT;
/// Default message-data UDP and TCP port.
pub const MD_PORT: u16 = config::DEFAULT_MD_PORT;
