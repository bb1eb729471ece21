//! Adapter dispatch for KubeAegis intents
//!
//! [`Dispatcher`] reads the adapter registry, picks the adapters that support
//! each intent request, and calls them over gRPC. Online adapters are called
//! inline; offline ones are handed to the [`RetrySupervisor`], which delivers
//! once they come online. Successful deliveries are written as a
//! [`PolicyReport`] when the intent asks for one.

#![deny(missing_docs)]

mod client;
mod delivery;
mod dispatcher;
mod report;
mod supervisor;

pub use client::{AdapterClient, ClientConfig, GrpcAdapterClient};
pub use delivery::DispatchJob;
pub use dispatcher::{
    deletion_notice_name, Delivered, DispatchFailure, DispatchSummary, Dispatcher,
};
pub use report::{FileReportSink, PolicyReport, ReportSink, DEFAULT_REPORT_DIR};
pub use supervisor::{RetrySupervisor, DEFAULT_RETRY_INTERVAL};
