//! # clrscope - Runtime Event Sink and Attach Controller
//!
//! clrscope attaches a diagnostics component (the *event sink*) to an
//! already-running managed process and receives the runtime's lifecycle
//! events for as long as the attachment lasts: module, assembly and class
//! loads, JIT compilation, garbage collections, exceptions and thread
//! activity.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                       Controller (clrscope)                     │
//! │                                                                 │
//! │  ┌──────────────┐   ┌──────────────┐   ┌──────────────────┐     │
//! │  │   Process    │──▶│    Attach    │◀──│ Runtime Directory│     │
//! │  │   Locator    │   │  Negotiator  │   │  (RuntimeHost)   │     │
//! │  └──────────────┘   └──────┬───────┘   └──────────────────┘     │
//! └────────────────────────────┼────────────────────────────────────┘
//!                              │ ProfilingAttach (pluggable transport)
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                  Target Process (managed runtime)               │
//! │                                                                 │
//! │  SinkFactory ──▶ EventSink ──▶ handlers ──▶ Logger              │
//! │                     │   ▲                                       │
//! │     PairingTracker ◀┘   └── ProfilerInfo + NameResolver         │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Module Structure
//!
//! - [`process_lookup`]: resolve a process by name or pid to an owned pidfd
//! - [`runtime`]: installed/loaded runtimes, runtime version from a PE image,
//!   the local and loopback hosts
//! - [`attach`]: request validation and the attach state machine
//! - [`sink`]: the event sink: interface identities, reference counting,
//!   lifecycle, event dispatch and the component factory
//! - [`naming`]: type and function name resolution
//! - [`logging`]: severity-levelled logger collaborators
//! - [`replay`]: drive a recorded trace through an in-process sink
//! - [`preflight`]: local checks run before an attach
//! - [`cli`]: command-line arguments
//! - [`domain`]: core domain types and errors
//!
//! ## Typical Usage
//!
//! ```bash
//! # Which runtimes does the process host?
//! clrscope runtimes my-app
//!
//! # Load the sink into it
//! clrscope attach my-app --runtime 8.0.4 --path /opt/clrscope/libclrscope.so
//!
//! # Replay a recorded trace
//! clrscope replay trace.json
//! ```

pub mod attach;
pub mod cli;
pub mod domain;
pub mod logging;
pub mod naming;
pub mod preflight;
pub mod process_lookup;
pub mod replay;
pub mod runtime;
pub mod sink;
