// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Buffer and command lifecycle management for asynchronous transform engines.
//!
//! This crate sits between a stream parser and a hardware decode/transform engine. The
//! [`codec::CodecBase`] manager admits coded units, maps the parser's decode indices onto decode
//! buffer slots, keeps reference counts of buffers shared between in-flight commands and
//! reference frames, submits stream parameter and transform commands to a
//! [`backend::Transformer`], and handles their completions, which are delivered from the engine's
//! own execution context.
//!
//! Codec-specific behavior (buffer shapes, command payloads, completion validation) is injected
//! through the [`codec::CodecStrategy`] trait.

pub mod backend;
pub mod buffer;
pub mod codec;
pub mod config;

use std::fmt;

use enumn::N;

/// Externally observable state of a [`codec::CodecBase`].
///
/// The encapsulating pipeline inspects this to decide whether to keep feeding work.
#[derive(N, Copy, Clone, Debug, Default, PartialEq, Eq)]
#[repr(u8)]
pub enum ComponentState {
    /// Not registered with an output ring yet, or reset.
    #[default]
    Idle = 0,
    /// Accepting coded units.
    Running = 1,
    /// Halted, commands are no longer sent to the engine.
    Halted = 2,
    /// A failure that could not be absorbed locally occurred.
    InError = 3,
}

/// An exact rational number, used to publish frame rates without rounding.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Rational {
    pub numerator: u64,
    pub denominator: u64,
}

impl Rational {
    pub fn new(numerator: u64, denominator: u64) -> Self {
        Self {
            numerator,
            denominator,
        }
    }

    /// Returns `None` if the denominator is zero.
    pub fn checked_new(numerator: u64, denominator: u64) -> Option<Self> {
        if denominator == 0 {
            None
        } else {
            Some(Self::new(numerator, denominator))
        }
    }

    /// Integer part of the value, rounded towards zero.
    pub fn integer_part(&self) -> u64 {
        self.numerator / self.denominator
    }

    pub fn as_f64(&self) -> f64 {
        self.numerator as f64 / self.denominator as f64
    }
}

impl From<u64> for Rational {
    fn from(value: u64) -> Self {
        Self::new(value, 1)
    }
}

impl fmt::Display for Rational {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.numerator, self.denominator)
    }
}
