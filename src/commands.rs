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

//! The five text commands a host control surface forwards to this crate.
//!
//! | command   | call                                   |
//! |-----------|----------------------------------------|
//! | `create`  | [`VmxVm::create`](crate::VmxVm::create) |
//! | `destroy` | [`VmxVm::destroy`](crate::VmxVm::destroy) |
//! | `enable`  | [`VmxLifecycle::enable`](crate::VmxLifecycle::enable) |
//! | `disable` | [`VmxLifecycle::disable`](crate::VmxLifecycle::disable) |
//! | `launch`  | [`VmxVm::launch`](crate::VmxVm::launch) |

use alloc::string::{String, ToString};
use core::fmt;
use core::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Enable,
    Disable,
    Create,
    Destroy,
    Launch,
}

impl Command {
    pub const ALL: [Command; 5] = [
        Command::Enable,
        Command::Disable,
        Command::Create,
        Command::Destroy,
        Command::Launch,
    ];

    pub const fn as_str(self) -> &'static str {
        match self {
            Command::Enable => "enable",
            Command::Disable => "disable",
            Command::Create => "create",
            Command::Destroy => "destroy",
            Command::Launch => "launch",
        }
    }

    /// Matches the start of `input` after surrounding whitespace is removed, so
    /// a trailing newline or argument written by the control surface is accepted.
    pub fn parse(input: &str) -> Option<Self> {
        let input = input.trim();
        Self::ALL
            .into_iter()
            .find(|cmd| input.starts_with(cmd.as_str()))
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Input that names none of the known commands.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownCommand(pub String);

impl fmt::Display for UnknownCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown command {:?}", self.0)
    }
}

impl FromStr for Command {
    type Err = UnknownCommand;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s).ok_or_else(|| UnknownCommand(s.trim().to_string()))
    }
}
