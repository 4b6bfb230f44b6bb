#![allow(unused_imports)]

use super::{type_alias::*, *};
use std::{
    array, mem, ptr,
    sync::{atomic::*, mpsc, *},
    thread,
    time::Duration,
};

use futures::executor::block_on;
use futures::future::join_all;
use rand::Rng;
use simple_logger::SimpleLogger;

static PORT: AtomicU16 = AtomicU16::new(31850);

#[inline]
pub(self) fn next_port() -> u16 {
    PORT.fetch_add(1, Ordering::SeqCst)
}

pub(self) const LOCALHOST: &str = "127.0.0.1";

/// Test configuration: a smaller receive ring keeps per-endpoint memory low
/// so tests can run many endpoints in parallel.
pub(self) fn test_config() -> Config {
    Config {
        rx_ring_size: 512,
        ..Config::default()
    }
}

/// Copy a `MsgBuf`'s payload out into a `Vec`.
pub(self) fn payload_of(msgbuf: &MsgBuf) -> Vec<u8> {
    unsafe { msgbuf.as_slice() }.to_vec()
}

/// Wrapping byte sum, used as an end-to-end checksum.
pub(self) fn checksum(bytes: &[u8]) -> u64 {
    bytes.iter().fold(0u64, |acc, &b| acc.wrapping_add(b as u64))
}

mod control_plane;
mod corners;
mod large;
mod loss;
