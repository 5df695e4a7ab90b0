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

use core::fmt;

use super::GeneralRegisters;

/// Registers that differ between two snapshots of the same guest, typically taken
/// at consecutive exits.
#[derive(Clone, Copy)]
pub struct GeneralRegistersDiff {
    before: GeneralRegisters,
    after: GeneralRegisters,
}

impl GeneralRegistersDiff {
    const RSP_INDEX: u8 = 4;

    pub fn new(before: GeneralRegisters, after: GeneralRegisters) -> Self {
        Self { before, after }
    }

    /// `true` if no register changed. The `rsp` placeholder slot is not compared.
    pub fn is_same(&self) -> bool {
        self.changed().next().is_none()
    }

    /// Changed registers as `(name, before, after)`, in register-number order.
    pub fn changed(&self) -> impl Iterator<Item = (&'static str, u64, u64)> + '_ {
        (0..16u8)
            .filter(|&i| i != Self::RSP_INDEX)
            .filter_map(move |i| {
                let old = self.before.get_reg_of_index(i);
                let new = self.after.get_reg_of_index(i);
                (old != new).then(|| (GeneralRegisters::register_name(i), old, new))
            })
    }
}

impl fmt::Debug for GeneralRegistersDiff {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut list = f.debug_map();
        for (name, old, new) in self.changed() {
            list.key(&name).value(&format_args!("{old:#x} -> {new:#x}"));
        }
        list.finish()
    }
}
