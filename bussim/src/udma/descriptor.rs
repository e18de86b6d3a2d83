// Copyright 2023 Google LLC
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//      http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! The 32-byte transfer descriptor and the checks made before any of its
//! data moves.

use crate::config::{LocalMemoryRange, UdmaConfig};
use crate::transactor::{split_range, Piece};

use bitvec::prelude::*;
use num::Integer;
use std::fmt;

pub const DESCRIPTOR_SIZE: u64 = 32;

/// Largest partial transfer.
const MAX_PARTIAL_BYTES: u32 = 16;

/// The one-hot error conditions of the STATUS register.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum UdmaError {
    BadDescriptor,
    CrossRamBoundary,
    PifAddressError,
    PifDataError,
}

impl UdmaError {
    pub fn bit(&self) -> u32 {
        match self {
            UdmaError::BadDescriptor => 1 << 0,
            UdmaError::CrossRamBoundary => 1 << 1,
            UdmaError::PifAddressError => 1 << 2,
            UdmaError::PifDataError => 1 << 3,
        }
    }
}

impl fmt::Display for UdmaError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(match self {
            UdmaError::BadDescriptor => "BAD_DESCRIPTOR",
            UdmaError::CrossRamBoundary => "CROSS_RAM_BOUNDARY",
            UdmaError::PifAddressError => "PIF_ADDRESS_ERROR",
            UdmaError::PifDataError => "PIF_DATA_ERROR",
        })
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Direction {
    LocalToPif,
    PifToLocal,
}

/// One read-then-write unit of a row.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Chunk {
    /// Address on the PIF side.
    pub external: u64,
    pub local: u64,
    pub len: u32,
    /// PIF block beats; 0 for a partial transfer.
    pub beats: u32,
}

#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct Descriptor {
    pub source_address: u32,
    pub destination_address: u32,
    pub num_bytes_per_row: u32,
    /// PIF beats per block; 0 selects partial transfers.
    pub max_block_transfers: u32,
    pub max_outstanding: u32,
    pub sync_interrupt_enable: bool,
    pub num_rows: u32,
    pub source_pitch: u32,
    pub destination_pitch: u32,
}

fn word(bytes: &[u8], offset: usize) -> u32 {
    bytes[offset..offset + 4].view_bits::<Lsb0>().load_le::<u32>()
}

impl Descriptor {
    /// Decodes the little-endian layout. Reserved block encodings and short
    /// input are bad descriptors.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, UdmaError> {
        if bytes.len() < DESCRIPTOR_SIZE as usize {
            return Err(UdmaError::BadDescriptor);
        }
        let control = word(bytes, 8);
        let bits = control.view_bits::<Lsb0>();
        let max_block_transfers = match bits[24..27].load_le::<u32>() {
            0 => 0,
            encoded @ 1..=4 => 1 << encoded,
            _ => return Err(UdmaError::BadDescriptor),
        };
        Ok(Self {
            source_address: word(bytes, 0),
            destination_address: word(bytes, 4),
            num_bytes_per_row: bits[0..22].load_le::<u32>(),
            max_block_transfers,
            max_outstanding: bits[27..30].load_le::<u32>() + 1,
            sync_interrupt_enable: bits[31],
            num_rows: word(bytes, 12) & 0xffff,
            source_pitch: word(bytes, 16),
            destination_pitch: word(bytes, 20),
        })
    }

    pub fn to_bytes(&self) -> [u8; DESCRIPTOR_SIZE as usize] {
        let mut control = 0u32;
        let bits = control.view_bits_mut::<Lsb0>();
        bits[0..22].store_le(self.num_bytes_per_row);
        bits[24..27].store_le(match self.max_block_transfers {
            0 => 0u32,
            beats => beats.trailing_zeros(),
        });
        bits[27..30].store_le(self.max_outstanding.saturating_sub(1));
        bits.set(31, self.sync_interrupt_enable);
        let mut bytes = [0u8; DESCRIPTOR_SIZE as usize];
        for (i, value) in [
            self.source_address,
            self.destination_address,
            control,
            self.num_rows & 0xffff,
            self.source_pitch,
            self.destination_pitch,
        ]
        .iter()
        .enumerate()
        {
            bytes[i * 4..i * 4 + 4].copy_from_slice(&value.to_le_bytes());
        }
        bytes
    }

    pub fn total_bytes(&self) -> u64 {
        self.num_bytes_per_row as u64 * self.num_rows as u64
    }

    /// (source, destination) of row `row`.
    pub fn row_addresses(&self, row: u32) -> (u64, u64) {
        (
            self.source_address as u64 + row as u64 * self.source_pitch as u64,
            self.destination_address as u64 + row as u64 * self.destination_pitch as u64,
        )
    }

    /// (external, local) of row `row`.
    pub fn row_sides(&self, row: u32, direction: Direction) -> (u64, u64) {
        let (source, destination) = self.row_addresses(row);
        match direction {
            Direction::LocalToPif => (destination, source),
            Direction::PifToLocal => (source, destination),
        }
    }

    /// Checks every rule a descriptor must pass before data moves.
    pub fn validate(&self, config: &UdmaConfig) -> Result<Direction, UdmaError> {
        if self.num_rows == 0 || self.num_bytes_per_row == 0 {
            return Err(UdmaError::BadDescriptor);
        }
        let is_local =
            |address: u32| config.local_memories.iter().any(|m| m.contains(address as u64, 1));
        let direction = match (
            is_local(self.source_address),
            is_local(self.destination_address),
        ) {
            (true, false) => Direction::LocalToPif,
            (false, true) => Direction::PifToLocal,
            _ => return Err(UdmaError::BadDescriptor),
        };
        let len = self.num_bytes_per_row as u64;
        for row in 0..self.num_rows {
            let (external, local) = self.row_sides(row, direction);
            if self.max_block_transfers == 0 {
                if external % 16 != local % 16 {
                    return Err(UdmaError::BadDescriptor);
                }
            } else {
                let block = self.max_block_transfers as u64 * config.pif_byte_width as u64;
                let local_alignment = block.min(config.local_byte_width as u64);
                if !Integer::is_multiple_of(&len, &block)
                    || !Integer::is_multiple_of(&external, &block)
                    || !Integer::is_multiple_of(&local, &local_alignment)
                {
                    return Err(UdmaError::BadDescriptor);
                }
            }
            if local_memory(&config.local_memories, local, len).is_none() {
                return Err(UdmaError::CrossRamBoundary);
            }
        }
        Ok(direction)
    }

    /// The chunks of row `row` in address order.
    pub fn chunks(&self, row: u32, direction: Direction, pif_byte_width: u32) -> Vec<Chunk> {
        let (external, local) = self.row_sides(row, direction);
        let len = self.num_bytes_per_row as u64;
        if self.max_block_transfers == 0 {
            let width = pif_byte_width.min(MAX_PARTIAL_BYTES);
            return split_range(external, len, width, 1)
                .into_iter()
                .filter_map(|piece| match piece {
                    Piece::Single { address, size } => Some(Chunk {
                        external: address,
                        local: local + (address - external),
                        len: size,
                        beats: 0,
                    }),
                    Piece::Block { .. } => None,
                })
                .collect();
        }
        let block = self.max_block_transfers * pif_byte_width;
        (0..len / block as u64)
            .map(|i| Chunk {
                external: external + i * block as u64,
                local: local + i * block as u64,
                len: block,
                beats: self.max_block_transfers,
            })
            .collect()
    }
}

/// The local memory holding all of `[address, address + len)`.
pub fn local_memory(
    memories: &[LocalMemoryRange],
    address: u64,
    len: u64,
) -> Option<&LocalMemoryRange> {
    memories.iter().find(|m| m.contains(address, len))
}

#[cfg(test)]
mod tests {
    use super::*;

    const LOCAL: u32 = 0x6000_0000;

    fn copy(source: u32, destination: u32, bytes: u32, blocks: u32) -> Descriptor {
        Descriptor {
            source_address: source,
            destination_address: destination,
            num_bytes_per_row: bytes,
            max_block_transfers: blocks,
            max_outstanding: 2,
            num_rows: 1,
            ..Default::default()
        }
    }

    #[test]
    fn test_layout() {
        let descriptor = Descriptor {
            source_address: 0x1234_5678,
            destination_address: LOCAL,
            num_bytes_per_row: 0x3f_ffff,
            max_block_transfers: 8,
            max_outstanding: 8,
            sync_interrupt_enable: true,
            num_rows: 3,
            source_pitch: 0x100,
            destination_pitch: 0x200,
        };
        let bytes = descriptor.to_bytes();
        assert_eq!(&bytes[0..4], &[0x78, 0x56, 0x34, 0x12]);
        assert_eq!(
            u32::from_le_bytes([bytes[8], bytes[9], bytes[10], bytes[11]]),
            0x3f_ffff | 3 << 24 | 7 << 27 | 1 << 31
        );
        assert_eq!(Descriptor::from_bytes(&bytes), Ok(descriptor));
    }

    #[test]
    fn test_reserved_encodings_are_bad() {
        let mut bytes = copy(LOCAL, 0, 16, 0).to_bytes();
        bytes[11] |= 0x05;
        assert_eq!(Descriptor::from_bytes(&bytes), Err(UdmaError::BadDescriptor));
        assert_eq!(Descriptor::from_bytes(&bytes[..16]), Err(UdmaError::BadDescriptor));
    }

    #[test]
    fn test_validation() {
        let config = UdmaConfig::default();
        assert_eq!(copy(LOCAL, 0x1000, 40, 0).validate(&config), Ok(Direction::LocalToPif));
        assert_eq!(copy(0x1000, LOCAL, 64, 4).validate(&config), Ok(Direction::PifToLocal));
        // Partial transfers need the same 16-byte phase.
        assert_eq!(
            copy(LOCAL + 4, 0x1008, 8, 0).validate(&config),
            Err(UdmaError::BadDescriptor)
        );
        // Blocks of 4 x 8 bytes: length, external and local alignment.
        assert_eq!(copy(0x1000, LOCAL, 40, 4).validate(&config), Err(UdmaError::BadDescriptor));
        assert_eq!(copy(0x1010, LOCAL, 32, 4).validate(&config), Err(UdmaError::BadDescriptor));
        assert_eq!(copy(0x1000, LOCAL + 4, 32, 4).validate(&config), Err(UdmaError::BadDescriptor));
        // Both sides external, both local, or nothing to move.
        assert_eq!(copy(0x1000, 0x2000, 8, 0).validate(&config), Err(UdmaError::BadDescriptor));
        assert_eq!(copy(LOCAL, LOCAL + 64, 8, 0).validate(&config), Err(UdmaError::BadDescriptor));
        assert_eq!(copy(LOCAL, 0x1000, 0, 0).validate(&config), Err(UdmaError::BadDescriptor));
        // The row runs off the end of the local memory.
        assert_eq!(
            copy(LOCAL + 0xfff0, 0x1000, 0x20, 0).validate(&config),
            Err(UdmaError::CrossRamBoundary)
        );
    }

    #[test]
    fn test_later_rows_are_checked() {
        let config = UdmaConfig::default();
        let mut descriptor = copy(0x1000, LOCAL, 32, 4);
        descriptor.num_rows = 3;
        descriptor.source_pitch = 0x100;
        descriptor.destination_pitch = 0x8000;
        assert_eq!(descriptor.validate(&config), Err(UdmaError::CrossRamBoundary));
        descriptor.destination_pitch = 0x40;
        assert_eq!(descriptor.validate(&config), Ok(Direction::PifToLocal));
    }

    #[test]
    fn test_chunks() {
        let partial = copy(LOCAL + 3, 0x1003, 14, 0);
        let chunks = partial.chunks(0, Direction::LocalToPif, 8);
        assert_eq!(
            chunks.iter().map(|c| (c.external, c.len)).collect::<Vec<_>>(),
            vec![(0x1003, 1), (0x1004, 4), (0x1008, 8), (0x1010, 1)]
        );
        assert_eq!(chunks[1].local, LOCAL as u64 + 4);

        let mut blocks = copy(0x1000, LOCAL, 64, 4);
        blocks.num_rows = 2;
        blocks.source_pitch = 0x100;
        blocks.destination_pitch = 0x40;
        let chunks = blocks.chunks(1, Direction::PifToLocal, 8);
        assert_eq!(chunks.len(), 2);
        assert_eq!(
            chunks[1],
            Chunk {
                external: 0x1120,
                local: LOCAL as u64 + 0x60,
                len: 32,
                beats: 4
            }
        );
    }
}
