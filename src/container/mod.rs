//! Container supervision: one sandboxed worker process per identity.
//!
//! ## Overview
//!
//! A `ContainerActor` owns a single worker process hosted by some
//! `ProcessControl` runtime. It starts the process on demand, waits for its
//! ports, forwards HTTP traffic to it, stops it after a period of inactivity
//! and runs durable one-shot tasks from an alarm-driven scheduler.
//!
//! ## Module Map
//!
//! ```text
//! ┌──────────┐  HTTP   ┌──────────────────────────────────────────────────┐
//! │  Client  │ ──────> │  server.rs  (axum Router, /{identity}/...)        │
//! └──────────┘ <────── │    └─ registry.rs  (ActorRegistry, alarm drivers)│
//!                      │         │                                        │
//!                      │         │ ContainerActor::fetch()                │
//!                      │         v                                        │
//!                      │  proxy.rs  (start if needed, tracked bodies)     │
//!                      │         │                                        │
//!                      │         │ start_and_wait_for_ports()             │
//!                      │         v                                        │
//!                      │  actor.rs  (start lock, probes, exit monitor)    │
//!                      │         │                                        │
//!                      │         │ ProcessControl                          │
//!                      │         v                                        │
//!                      │  local.rs  (child process, TCP probe, reqwest)   │
//!                      └──────────────────────────────────────────────────┘
//! ```
//!
//! ## Supporting Modules
//!
//! | Module       | Responsibility                                              |
//! |--------------|-------------------------------------------------------------|
//! | `models`     | `ProcessState`, `ContainerStatus`, `ScheduledTask`, `Signal` |
//! | `storage`    | SQLite status slot, task table, wake-up slot (`StorageHandle`) |
//! | `alarm`      | `AlarmClock` + driver task with retry backoff               |
//! | `scheduler`  | `schedule()`, `TaskHandlers`, the alarm handler             |
//! | `activity`   | Idle deadline and open-stream accounting                    |
//! | `control`    | `ProcessControl` trait and runtime error classification     |
//! | `hooks`      | `LifecycleHooks` (`on_start`, `on_stop`, `on_error`)        |
//!
//! ## Wake-up Flow
//!
//! 1. `run_driver` sleeps until the stored wake time, clears it, and calls
//!    `ContainerActor::alarm()`.
//! 2. The handler re-arms 30s out, runs every due task, then reconciles any
//!    exit nobody observed.
//! 3. With no process running the alarm parks on the earliest task (or is
//!    cleared). Otherwise an expired idle deadline triggers a graceful stop,
//!    and a live process keeps the handler sleeping until the next task or
//!    deadline.

pub mod activity;
pub mod actor;
pub mod alarm;
pub mod control;
pub mod hooks;
pub mod local;
pub mod models;
pub mod proxy;
pub mod registry;
pub mod scheduler;
pub mod storage;

#[cfg(test)]
pub(crate) mod testing;

pub use actor::{ContainerActor, ContainerSettings, EnsureStartedOptions, WaitOptions};
pub use hooks::{DefaultHooks, LifecycleHooks};
pub use registry::ActorRegistry;
pub use scheduler::{TaskHandler, TaskHandlers};
