//! # browsergrid
//!
//! A browser-automation grid core: schedule incoming session requests onto
//! a dynamically changing fleet of nodes.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                        Distributor                           │
//! │  ┌─────────────┐  ┌────────────────┐  ┌──────────────────┐  │
//! │  │ HTTP surface│  │ Scheduling loop│  │ Health reconciler│  │
//! │  │ :4444       │  │ + node ranking │  │                  │  │
//! │  └─────────────┘  └────────────────┘  └──────────────────┘  │
//! └──────┬────────────────────┬──────────────────────┬──────────┘
//!        │                    │                      │
//!  ┌─────▼──────┐      ┌──────▼───────┐       ┌──────▼──────┐
//!  │ New-session│      │ Session map  │       │ Nodes       │
//!  │ queue      │      │              │       │ (slots +    │
//!  │ (FIFO +    │      │ id → session │       │  factories) │
//!  │  retries)  │      └──────────────┘       └─────────────┘
//! ```
//!
//! Components are loosely coupled over a typed event bus: the queue
//! announces pending requests, nodes announce closed sessions and their
//! own removal, and the distributor reacts. A new-session call parses the
//! payload into capability alternatives, queues the request, and waits —
//! bounded by the request timeout — for the scheduling loop to place it on
//! the best-ranked node with a free matching slot.

pub mod cli;
pub mod config;
pub mod data;
pub mod distributor;
pub mod events;
pub mod node;
pub mod queue;
pub mod server;
pub mod sessionmap;
