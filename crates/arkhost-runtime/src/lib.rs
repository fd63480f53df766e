//! Engine lifecycle and idle GC coordination for the arkhost embedding layer.
//!
//! The host builds a [`HostContext`] around its [`VmFactory`], then creates
//! engines inline or on dedicated threads. Each engine owns one VM and a
//! native environment and is bound to one thread's [`EventLoop`]. The
//! [`IdleMonitor`] watches idle windows reported by the host and asks the
//! targeted VM for collections when the process looks quiet.
//!
//! ```ignore
//! use arkhost_runtime::{HostConfig, HostContext};
//!
//! let context = HostContext::builder(factory)
//!     .config(HostConfig::from_file("arkhost.toml".as_ref())?)
//!     .thread_timer()
//!     .build()?;
//! let engine = context.create_engine_on_dedicated_thread()?;
//! context.set_gc_target(&engine);
//! engine.destroy();
//! ```

pub mod config;
pub mod context;
pub mod engine;
pub mod env;
pub mod error;
pub mod event_loop;
pub mod ffi;
pub mod idle;
pub mod runner;
pub mod timer;
pub mod vm;

pub use config::{EngineConfig, HostConfig, IdleConfig};
pub use context::{HostContext, HostContextBuilder};
pub use engine::{Engine, EngineScope, EngineState, LifecycleStats, LifecycleStatsSnapshot};
pub use env::{CleanupHookId, NativeEnv};
pub use error::{HostError, HostResult};
pub use event_loop::{EventLoop, ListenerId, LoopObserver};
pub use ffi::ArkStatus;
pub use idle::{GcTrigger, IdleMonitor, IdleStatsSnapshot};
pub use runner::LoopRunner;
pub use timer::{MonitorScheduler, ThreadTimer, TimerTask, now_ms};
pub use vm::{GcKind, ScriptSource, Vm, VmFactory, VmOptions};

pub use arkhost_loader as loader;
