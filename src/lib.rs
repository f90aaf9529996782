//! Real-time signal brokering between GAMs and data sources.
//!
//! Configuration compiles every GAM signal into a copy table; at run time
//! brokers replay those tables against double-buffered data source memory
//! while a scheduler cycles the GAMs of the active state on their threads.

pub mod application;
pub mod async_broker;
pub mod broker;
pub mod config;
pub mod container;
pub mod copy_table;
pub mod datasource;
pub mod dsl;
pub mod error;
pub mod executable;
pub mod gam;
#[doc(hidden)]
pub mod harness;
#[doc(hidden)]
pub mod invariant_ppt;
pub mod invariant_rt;
pub mod memory;
pub mod object;
pub mod realtime;
pub mod registry;
pub mod scheduler;
pub mod signal;
pub mod sync;
pub mod types;

pub use application::RealTimeApplication;
pub use async_broker::AsyncOutputBroker;
pub use broker::{Direction, MemoryMapBroker, OutputBroker};
pub use config::ApplicationConfig;
pub use container::ReferenceContainer;
pub use datasource::DataSource;
pub use error::{
    ApplicationError, BrokerError, ConfigurationError, ContainerError, CopyError, ExecutionError,
    SchedulerError, StepError,
};
pub use gam::{Gam, GamIo, GamLogic};
pub use object::{Object, Reference, ReferenceT};
pub use scheduler::{GamScheduler, MultiThreadScheduler};
pub use sync::Timeout;
