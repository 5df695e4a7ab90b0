// Copyright 2025 The Axvisor Team
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use alloc::boxed::Box;
use alloc::string::String;
use core::fmt;

use axerrno::{AxError, ax_err_type};

use crate::vmx::{VmxExitReason, VmxInstructionError};

/// Errors reported by the VMX core.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VmxError {
    /// The frame allocator could not satisfy a request.
    MemoryAllocationFailed,
    /// The processor or firmware lacks something VMX operation needs.
    UnsupportedFeature(String),
    /// VMX is not on for the current core.
    VmxNotEnabled,
    /// VMX is already on for the current core.
    VmxAlreadyEnabled,
    /// A VMCS or VM configuration value was rejected.
    InvalidVmcsConfig(String),
    /// A VMX instruction failed without a current VMCS (CF set).
    VmFailInvalid,
    /// A VMX instruction failed and left an error number in the current VMCS (ZF set).
    VmFailValid(VmxInstructionError),
    /// A broadcast operation failed on one core.
    CoreFailed { cpu: usize, error: Box<VmxError> },
    /// The guest stopped on an exit reason the dispatcher does not service.
    UnhandledExit(u32),
    /// An object was used in a state that does not permit the operation.
    BadState(&'static str),
}

/// Result alias used throughout the crate.
pub type Result<T = ()> = core::result::Result<T, VmxError>;

impl VmxError {
    /// Strips any [`VmxError::CoreFailed`] wrapping.
    pub fn root_cause(&self) -> &VmxError {
        match self {
            Self::CoreFailed { error, .. } => error.root_cause(),
            other => other,
        }
    }
}

impl fmt::Display for VmxError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MemoryAllocationFailed => write!(f, "memory allocation failed"),
            Self::UnsupportedFeature(what) => write!(f, "unsupported feature: {what}"),
            Self::VmxNotEnabled => write!(f, "VMX is not enabled"),
            Self::VmxAlreadyEnabled => write!(f, "VMX is already enabled"),
            Self::InvalidVmcsConfig(what) => write!(f, "invalid VMCS configuration: {what}"),
            Self::VmFailInvalid => write!(f, "VMfailInvalid"),
            Self::VmFailValid(err) => write!(f, "VMfailValid({}): {}", err.0, err.as_str()),
            Self::CoreFailed { cpu, error } => write!(f, "core {cpu}: {error}"),
            Self::UnhandledExit(reason) => match VmxExitReason::try_from(*reason) {
                Ok(known) => write!(f, "unhandled VM exit {known:?}"),
                Err(_) => write!(f, "unhandled VM exit {reason:#x}"),
            },
            Self::BadState(what) => write!(f, "bad state: {what}"),
        }
    }
}

impl From<VmxError> for AxError {
    fn from(err: VmxError) -> Self {
        match err {
            VmxError::MemoryAllocationFailed => ax_err_type!(NoMemory),
            VmxError::UnsupportedFeature(_) | VmxError::UnhandledExit(_) => {
                ax_err_type!(Unsupported)
            }
            VmxError::InvalidVmcsConfig(_) => ax_err_type!(InvalidInput),
            VmxError::CoreFailed { error, .. } => (*error).into(),
            VmxError::VmxNotEnabled
            | VmxError::VmxAlreadyEnabled
            | VmxError::VmFailInvalid
            | VmxError::VmFailValid(_)
            | VmxError::BadState(_) => ax_err_type!(BadState),
        }
    }
}
