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

//! The register file software uses to program the descriptor ring.
//! Writes to DESC_NUM add descriptors, STATUS is write-one-to-clear, any
//! write to INTERRUPT clears it and DESC_DONE is read-only.

use super::descriptor::DESCRIPTOR_SIZE;
use crate::Error;

use std::fmt;

pub const SETTINGS: u64 = 0x00;
pub const DESC_START: u64 = 0x04;
pub const DESC_END: u64 = 0x08;
pub const DESC_NUM: u64 = 0x0c;
pub const DESC_CUR_PTR: u64 = 0x10;
pub const STATUS: u64 = 0x14;
pub const INTERRUPT: u64 = 0x18;
pub const DESC_DONE: u64 = 0x1c;

/// Bytes spanned by the register file.
pub const REGISTER_SPACE: u64 = 0x20;

pub const SETTINGS_ENABLE: u32 = 1 << 0;
pub const SETTINGS_ERROR_INTERRUPT: u32 = 1 << 1;
pub const STATUS_ERRORS: u32 = 0xf;
pub const STATUS_BUSY: u32 = 1 << 8;
pub const INTERRUPT_PENDING: u32 = 1 << 0;

/// Whether a register write may let the engine start.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum WriteEffect {
    None,
    Kick,
}

#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct Registers {
    pub settings: u32,
    pub desc_start: u32,
    /// Address of the last descriptor slot of the ring.
    pub desc_end: u32,
    pub desc_num: u32,
    pub desc_cur_ptr: u32,
    /// Error bits only; busy is computed on read.
    pub status: u32,
    pub interrupt: u32,
    pub desc_done: u32,
}

impl Registers {
    pub fn enabled(&self) -> bool {
        self.settings & SETTINGS_ENABLE != 0
    }

    pub fn read(&self, offset: u64, busy: bool) -> Result<u32, Error> {
        Ok(match offset {
            SETTINGS => self.settings,
            DESC_START => self.desc_start,
            DESC_END => self.desc_end,
            DESC_NUM => self.desc_num,
            DESC_CUR_PTR => self.desc_cur_ptr,
            STATUS => self.status | if busy { STATUS_BUSY } else { 0 },
            INTERRUPT => self.interrupt,
            DESC_DONE => self.desc_done,
            _ => return Err(Error::InvalidAddress(offset)),
        })
    }

    pub fn write(&mut self, offset: u64, value: u32) -> Result<WriteEffect, Error> {
        match offset {
            SETTINGS => {
                self.settings = value & (SETTINGS_ENABLE | SETTINGS_ERROR_INTERRUPT);
                return Ok(WriteEffect::Kick);
            }
            DESC_START => self.desc_start = value,
            DESC_END => self.desc_end = value,
            DESC_NUM => {
                self.desc_num = self.desc_num.wrapping_add(value);
                return Ok(WriteEffect::Kick);
            }
            DESC_CUR_PTR => self.desc_cur_ptr = value,
            STATUS => self.status &= !(value & STATUS_ERRORS),
            INTERRUPT => self.interrupt = 0,
            DESC_DONE => log::warn!("DESC_DONE is read-only; write of {:#x} ignored", value),
            _ => return Err(Error::InvalidAddress(offset)),
        }
        Ok(WriteEffect::None)
    }

    /// Steps past the current descriptor, wrapping past DESC_END to
    /// DESC_START.
    pub fn advance(&mut self) {
        let next = self.desc_cur_ptr.wrapping_add(DESCRIPTOR_SIZE as u32);
        self.desc_cur_ptr = if next > self.desc_end || next < self.desc_cur_ptr {
            self.desc_start
        } else {
            next
        };
        self.desc_num = self.desc_num.saturating_sub(1);
        self.desc_done = self.desc_done.wrapping_add(1);
    }
}

impl fmt::Display for Registers {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "SETTINGS={:#x} DESC_START={:#010x} DESC_END={:#010x} DESC_NUM={} \
             DESC_CUR_PTR={:#010x} STATUS={:#x} INTERRUPT={:#x} DESC_DONE={}",
            self.settings,
            self.desc_start,
            self.desc_end,
            self.desc_num,
            self.desc_cur_ptr,
            self.status,
            self.interrupt,
            self.desc_done
        )
    }
}
