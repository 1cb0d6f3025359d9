// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Configuration of a [`CodecBase`](crate::codec::CodecBase).
//!
//! [`CodecConfiguration`] is filled out by the codec-specific code before registration and is
//! frozen when the output ring is registered. The few values that may change while running live
//! in [`RuntimeParameters`].

use std::io::Cursor;
use std::io::Read;
use std::time::Duration;

use byteorder::LittleEndian;
use byteorder::ReadBytesExt;
use enumn::N;
use thiserror::Error;

use crate::Rational;

/// Upper bound of decode buffer indices a manifestor may hand out.
pub const CODEC_MAX_DECODE_BUFFERS: usize = 32;

/// Maximum number of transformer names a codec may list.
pub const CODEC_MAX_TRANSFORMERS: usize = 4;

/// Size of the partition name field in a raw parameter block.
pub const PARTITION_NAME_SIZE: usize = 64;

/// Size of a raw parameter block accepted by [`CodecParameterBlock::parse`].
pub const PARAMETER_BLOCK_SIZE: usize = 8 + PARTITION_NAME_SIZE;

/// Parameters used by the trick mode policy, as configured plus the empirical decode rates
/// measured at runtime.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TrickModeParameters {
    /// Maximum decode rate measured over the short integration window.
    pub empirical_max_decode_frame_rate_short_integration: Rational,
    /// Maximum decode rate measured over the long integration window.
    pub empirical_max_decode_frame_rate_long_integration: Rational,
    pub substandard_decode_supported: bool,
    pub substandard_decode_rate_increase: Rational,
    pub default_group_size: u32,
    pub default_group_reference_frame_count: u32,
}

impl Default for TrickModeParameters {
    fn default() -> Self {
        Self {
            empirical_max_decode_frame_rate_short_integration: Rational::from(1024),
            empirical_max_decode_frame_rate_long_integration: Rational::from(1024),
            substandard_decode_supported: false,
            substandard_decode_rate_increase: Rational::from(1),
            default_group_size: 1,
            default_group_reference_frame_count: 0,
        }
    }
}

#[derive(Clone, Debug)]
pub struct CodecConfiguration {
    /// Name used to prefix every log message.
    pub codec_name: String,
    /// Candidate transformer names, the selected one is picked by [`RuntimeParameters`].
    pub transformer_names: Vec<String>,
    pub transcoded_memory_partition_name: String,
    pub ancillary_memory_partition_name: String,
    /// Size of the stream parameter context pool.
    pub stream_parameter_context_count: usize,
    /// Size of the decode context pool.
    pub decode_context_count: usize,
    /// How many decode indices may map onto the same decode buffer (e.g. two fields).
    pub max_decode_indices_per_buffer: usize,
    /// Shrink and detach coded buffers from a decode context as soon as it completes.
    pub shrink_coded_data_buffers_after_decode: bool,
    /// Do not look at the coded payload of incoming units.
    pub ignore_find_coded_data_buffer: bool,
    /// Allow several units with the same decode index (slice or field decoding).
    pub slice_decode_permitted: bool,
    pub trick_mode_parameters: TrickModeParameters,
    /// Number of decodes in the short rate integration window, doubled for field decodes.
    pub decode_time_short_integration_period: usize,
    /// Time allowed per outstanding context for commands to drain when halting.
    pub max_wait_for_command_completion: Duration,
}

impl Default for CodecConfiguration {
    fn default() -> Self {
        Self {
            codec_name: "Unspecified".into(),
            transformer_names: Vec::new(),
            transcoded_memory_partition_name: "BPA2_Region0".into(),
            ancillary_memory_partition_name: "BPA2_Region1".into(),
            stream_parameter_context_count: 1,
            decode_context_count: 4,
            max_decode_indices_per_buffer: 2,
            shrink_coded_data_buffers_after_decode: true,
            ignore_find_coded_data_buffer: false,
            slice_decode_permitted: false,
            trick_mode_parameters: Default::default(),
            decode_time_short_integration_period: 4,
            max_wait_for_command_completion: Duration::from_millis(100),
        }
    }
}

impl CodecConfiguration {
    pub fn available_transformers(&self) -> usize {
        self.transformer_names.len()
    }

    /// Upper bound of the time `Halt` waits for outstanding commands.
    pub fn max_drain_time(&self) -> Duration {
        let contexts = self.stream_parameter_context_count + self.decode_context_count;
        self.max_wait_for_command_completion * contexts as u32
    }
}

/// Values that administrative calls may change after the configuration has been frozen.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RuntimeParameters {
    pub selected_transformer: usize,
    /// Treat the next unit as carrying new stream parameters.
    pub force_stream_parameter_reload: bool,
}

#[derive(N, Copy, Clone, Debug, PartialEq, Eq)]
#[repr(u32)]
enum ParameterType {
    SelectTransformer = 0,
    SpecifyTranscodedMemoryPartition = 1,
    SpecifyAncillaryMemoryPartition = 2,
}

#[derive(Debug, Error)]
pub enum ParameterBlockError {
    #[error("invalid parameter block size {0}, expected {PARAMETER_BLOCK_SIZE}")]
    InvalidSize(usize),
    #[error("unrecognised parameter block type {0}")]
    UnknownType(u32),
    #[error("partition name is too long or not valid UTF-8")]
    InvalidPartitionName,
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Administrative reconfiguration request.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CodecParameterBlock {
    SelectTransformer(usize),
    TranscodedMemoryPartition(String),
    AncillaryMemoryPartition(String),
}

impl CodecParameterBlock {
    /// Parses a raw little-endian block: parameter type (`u32`), transformer id (`u32`) and a
    /// NUL-terminated partition name of [`PARTITION_NAME_SIZE`] bytes.
    pub fn parse(block: &[u8]) -> Result<Self, ParameterBlockError> {
        if block.len() != PARAMETER_BLOCK_SIZE {
            return Err(ParameterBlockError::InvalidSize(block.len()));
        }

        let mut cursor = Cursor::new(block);
        let raw_type = cursor.read_u32::<LittleEndian>()?;
        let transformer = cursor.read_u32::<LittleEndian>()?;
        let mut name = [0u8; PARTITION_NAME_SIZE];
        cursor.read_exact(&mut name)?;

        let parameter_type =
            ParameterType::n(raw_type).ok_or(ParameterBlockError::UnknownType(raw_type))?;

        let partition_name = || {
            let len = name.iter().position(|&b| b == 0).unwrap_or(name.len());
            std::str::from_utf8(&name[..len])
                .map(String::from)
                .map_err(|_| ParameterBlockError::InvalidPartitionName)
        };

        Ok(match parameter_type {
            ParameterType::SelectTransformer => Self::SelectTransformer(transformer as usize),
            ParameterType::SpecifyTranscodedMemoryPartition => {
                Self::TranscodedMemoryPartition(partition_name()?)
            }
            ParameterType::SpecifyAncillaryMemoryPartition => {
                Self::AncillaryMemoryPartition(partition_name()?)
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use byteorder::WriteBytesExt;

    use super::*;

    fn raw_block(parameter_type: u32, transformer: u32, name: &str) -> Vec<u8> {
        let mut block = Vec::new();
        block.write_u32::<LittleEndian>(parameter_type).unwrap();
        block.write_u32::<LittleEndian>(transformer).unwrap();
        let mut raw_name = [0u8; PARTITION_NAME_SIZE];
        raw_name[..name.len()].copy_from_slice(name.as_bytes());
        block.extend_from_slice(&raw_name);
        block
    }

    #[test]
    fn test_parse_select_transformer() {
        let block = CodecParameterBlock::parse(&raw_block(0, 3, "")).unwrap();
        assert_eq!(block, CodecParameterBlock::SelectTransformer(3));
    }

    #[test]
    fn test_parse_partition() {
        let block = CodecParameterBlock::parse(&raw_block(2, 0, "BPA2_Region7")).unwrap();
        assert_eq!(
            block,
            CodecParameterBlock::AncillaryMemoryPartition("BPA2_Region7".into())
        );
    }

    #[test]
    fn test_parse_malformed() {
        assert!(matches!(
            CodecParameterBlock::parse(&[0u8; 5]),
            Err(ParameterBlockError::InvalidSize(5))
        ));
        assert!(matches!(
            CodecParameterBlock::parse(&raw_block(9, 0, "")),
            Err(ParameterBlockError::UnknownType(9))
        ));
    }

    #[test]
    fn test_max_drain_time() {
        let config = CodecConfiguration::default();
        assert_eq!(config.max_drain_time(), Duration::from_millis(500));
    }
}
