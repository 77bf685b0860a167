// Weft - Peer-to-peer resource sharing fabric: CPU, memory and storage pooling over a minimal length-framed protocol
// Copyright (C) 2026  weft contributors

// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.

// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.

// You should have received a copy of the GNU General Public License
// along with this program.  If not, see <https://www.gnu.org/licenses/>.

//! Operating-system bookkeeping plane: resource accounting with deadlock
//! avoidance and detection, a free-list memory allocator, process lifecycle
//! tracking, and cooperative IPC primitives. These services are driven by
//! explicit wire operations; they do not instrument real locks or threads.

pub mod alloc;
pub mod deadlock;
pub mod ipc;
pub mod process;
