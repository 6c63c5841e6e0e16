//! # sdlrs: CCSDS space data link protocols for ground segment software
//!
//! This crate contains the link layer of a ground station: it turns raw downlink transfer frames
//! into application packets and turns telecommands into uplink transfer frames which are
//! delivered reliably with the Communications Operation Procedure-1 (COP-1).
//!
//! ## Overview
//!
//! The core modules of this crate include
//!
//!  - The [codec] module with checksums, the CCSDS pseudo-randomizer, the BCH code used for
//!    CLTUs and a generic Reed-Solomon codec.
//!  - The [frame] module which decodes and encodes TM (CCSDS 132.0-B), AOS (CCSDS 732.0-B) and
//!    USLP (CCSDS 732.1-B) transfer frames.
//!  - The [tc] module which builds TC transfer frames as specified in CCSDS 232.0-B.
//!  - The [packet] module which reassembles space packets and encapsulation packets spanning
//!    multiple frames of one virtual channel.
//!  - The [cop1] module which implements the FOP-1 side of COP-1 as specified in CCSDS 232.1-B.
//!  - The [mux] module which selects the next uplink frame across multiple virtual channels.
//!  - The [demux] module which glues the downlink components together and feeds the CLCW found
//!    in the operational control field back to the FOP-1 engines.
//!
//! Transport plumbing (sockets, serial lines) and configuration loading are not part of this
//! crate. The `sdlrs-example` application shows how to connect the components to UDP sockets.
#![no_std]
#![cfg_attr(docsrs, feature(doc_auto_cfg))]
#[cfg(any(feature = "alloc", test))]
extern crate alloc;
#[cfg(any(feature = "std", test))]
extern crate std;

pub mod codec;
pub mod config;
#[cfg(feature = "std")]
pub mod cop1;
#[cfg(feature = "std")]
pub mod demux;
pub mod frame;
#[cfg(feature = "std")]
pub mod mux;
#[cfg(feature = "alloc")]
pub mod packet;
pub mod queue;
pub mod security;
#[cfg(feature = "alloc")]
pub mod tc;

pub use spacepackets;

/// Virtual channel identifier. Six bits are used by AOS, USLP and TC, three bits by TM.
pub type VcId = u8;

/// Spacecraft identifier. The width depends on the frame format (8, 10 or 16 bits).
pub type SpacecraftId = u16;

/// Identifier of a telecommand. It is used to report the acknowledgement status of commands
/// carried inside TC transfer frames.
pub type CommandId = u64;
