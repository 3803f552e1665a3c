//! UniLink device connectivity.
//!
//! ## Features
//!
//! | Feature | Default | Description |
//! |---------|---------|-------------|
//! | `mqtt` | ✅ | MQTT broker transport (rumqttc) |
//! | `http` | ✅ | HTTP transport (reqwest) |
//!
//! ## Architecture
//!
//! - **ProtocolAdapter**: uniform connect/send/subscribe contract per protocol
//! - **AdapterFactory**: builds adapters and discovery handles from typed configs
//! - **StrategyEngine**: scores connection strategies and selects a protocol
//! - **DeviceCommunicator**: per-device state machine, reconnects and re-evaluation
//! - **AdapterManager**: routes devices to adapters and executes commands
//! - **ConnectivityRuntime**: owns all of the above with an explicit lifecycle
//!
//! BLE, Matter and cloud links run over the in-process loopback network; MQTT
//! and HTTP use real clients when their features are enabled.

pub mod adapter;
pub mod adapters;
pub mod communicator;
pub mod factory;
pub mod manager;
pub mod runtime;
pub mod scheduler;
pub mod strategy;
pub mod transport;

pub use adapter::{
    AdapterEvent, AdapterEventStream, AdapterMessage, DeviceDiscovery, Diagnostics,
    DiscoveryStream, ProtocolAdapter, StateStream,
};
pub use communicator::DeviceCommunicator;
pub use factory::{AdapterFactory, FactoryError, FactoryResult, FactoryStats};
pub use manager::{
    default_protocol_for, AdapterManager, ConnectionStateSink, ConnectionTable,
    ConnectivityAdapter, DeviceAdapter, DeviceStatus, ManagerStats, MemoryStateSink, StateRecord,
    AUTOMATIC_ADAPTER,
};
pub use runtime::{ConnectivityRuntime, RuntimeBuilder, RuntimeError, RuntimeResult, RuntimeState};
pub use scheduler::ScheduledTask;
pub use strategy::{
    ConnectionStrategy, ExpectedPerformance, ProtocolSelection, StrategyEngine, StrategyError,
    StrategyEvaluation,
};
pub use transport::{
    Advertisement, DefaultTransportProvider, LoopbackNetwork, LoopbackTransportProvider,
    Transport, TransportError, TransportProvider,
};
