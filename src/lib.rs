//! Zigbee AF/ZCL messaging core
//!
//! This library turns a Zigbee radio transport, which delivers confirmations and indications
//! asynchronously and unordered, into a request/response API. It also drives the interview
//! protocol used to discover the clusters and attributes of remote devices. Library uses
//! asynchronous Rust and depends on Tokio.
//! Following are main parts of api:
//! - [Af](af::Af) - messaging core bound to one [Controller](controller::Controller). Transport events are fed
//!                  through [Af::inbound](af::Af::inbound), application indications arrive on the receiver
//!                  returned by [Af::new](af::Af::new).
//!   - [send](af::Af::send) / [send_ext](af::Af::send_ext) - AF data frames awaiting the radio confirmation.
//!   - [zcl_foundation](af::Af::zcl_foundation) / [zcl_functional](af::Af::zcl_functional) - ZCL commands
//!                  awaiting the correlated response.
//!   - [interview_clusters](af::Af::interview_clusters) - discovery and read of all attributes of an endpoint.
//! - [Controller](controller::Controller), [Coordinator](endpoint::Coordinator), [Endpoint](endpoint::Endpoint),
//!   [ZclCodec](codec::ZclCodec) - traits the embedding application implements for the radio,
//!                  the device database and the ZCL frame codec.
//! - [AfConfig](config::AfConfig) - timeouts and protocol defaults, loadable from json.
//!
//! Example reading the basic cluster of a device:
//! ```no_run
//! # use zaf::{af::Af, codec::ZclCodec, config::AfConfig, controller::Controller, endpoint::Endpoint};
//! # use zaf::frame::ZclPayload;
//! # use zaf::zcl::ZclConfig;
//! # use anyhow::Result;
//! # use std::sync::Arc;
//! # async fn example(controller: Arc<dyn Controller>, codec: Arc<dyn ZclCodec>, device: Arc<dyn Endpoint>) -> Result<()> {
//! let (af, mut indications) = Af::new(controller, codec, AfConfig::default());
//! // self-addressed read is sent through the delegator of the device's profile
//! let rsp = af.zcl_foundation(&device, &device, "genBasic", "read",
//!                             ZclPayload::Read(vec![0x0004, 0x0005]), ZclConfig::default()).await?;
//! println!("{:?}", rsp);
//! # Ok(())
//! # }
//! ```
//!
//! Example interviewing an endpoint:
//! ```no_run
//! # use zaf::af::Af;
//! # use zaf::endpoint::Endpoint;
//! # use zaf::interview::{InterviewConfig, InterviewProgress};
//! # use anyhow::Result;
//! # use std::sync::Arc;
//! # async fn example(af: Arc<Af>, device: Arc<dyn Endpoint>) -> Result<()> {
//! let (tx, mut progress) = tokio::sync::mpsc::unbounded_channel::<InterviewProgress>();
//! tokio::spawn(async move {
//!     while let Some(p) = progress.recv().await {
//!         println!("cluster {} {}/{}", p.cluster_id, p.current, p.total);
//!     }
//! });
//! let cfg = InterviewConfig { progress: Some(tx), ..Default::default() };
//! let clusters = af.interview_clusters(&device, cfg).await?;
//! for (name, c) in clusters {
//!     println!("{} {:?}", name, c.attrs);
//! }
//! # Ok(())
//! # }
//! ```

pub mod af;
pub mod codec;
pub mod config;
pub mod controller;
pub mod correlation;
mod dispatch;
pub mod endpoint;
pub mod error;
pub mod event;
pub mod frame;
pub mod interview;
pub mod limiter;
pub mod zcl;

#[cfg(test)]
mod testutil;
