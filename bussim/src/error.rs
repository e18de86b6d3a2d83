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

use std::fmt;

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Error {
    /// A parameter combination rejected when the component is built.
    InvalidConfiguration { module: String, reason: String },
    InvalidAddress(u64),
    InvalidValueWidth { expected: usize, actual: usize },
    InvalidPort(usize),
    UnboundPort { module: String, port: usize },
    AlreadyBound { module: String, port: usize },
    BindingCycle(String),
    QueueFull(usize),
    QueueEmpty(usize),
    ModeSwitch(String),
    UnknownCommand(String),
    InvalidArgument(String),
    /// Internal invariant violation; aborts the simulation.
    Protocol {
        module: String,
        tag: Option<u64>,
        address: Option<u64>,
        reason: String,
    },
}

impl Error {
    pub fn config<M: fmt::Display, R: fmt::Display>(module: M, reason: R) -> Self {
        Self::InvalidConfiguration {
            module: module.to_string(),
            reason: reason.to_string(),
        }
    }

    pub fn protocol<M: fmt::Display, R: fmt::Display>(
        module: M,
        tag: Option<u64>,
        address: Option<u64>,
        reason: R,
    ) -> Self {
        Self::Protocol {
            module: module.to_string(),
            tag,
            address,
            reason: reason.to_string(),
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::InvalidConfiguration { module, reason } => {
                write!(f, "ERROR: invalid configuration for {}: {}", module, reason)
            }
            Self::InvalidAddress(address) => write!(f, "ERROR: invalid address {:#010x}", address),
            Self::InvalidValueWidth { expected, actual } => write!(
                f,
                "ERROR: value has {} bits, expected {} bits",
                actual, expected
            ),
            Self::UnboundPort { module, port } => {
                write!(f, "ERROR: port {} of {} is not bound", port, module)
            }
            Self::AlreadyBound { module, port } => {
                write!(f, "ERROR: port {} of {} is already bound", port, module)
            }
            Self::Protocol {
                module,
                tag,
                address,
                reason,
            } => {
                write!(f, "ERROR: {}: {}", module, reason)?;
                if let Some(tag) = tag {
                    write!(f, " (tag={})", tag)?;
                }
                if let Some(address) = address {
                    write!(f, " (address={:#010x})", address)?;
                }
                Ok(())
            }
            _ => write!(f, "{:?}", self),
        }
    }
}

impl std::error::Error for Error {}
