// MIT License
//
// Copyright (c) 2019-2021 Tobias Pfeiffer
//
// Permission is hereby granted, free of charge, to any person obtaining a copy
// of this software and associated documentation files (the "Software"), to deal
// in the Software without restriction, including without limitation the rights
// to use, copy, modify, merge, publish, distribute, sublicense, and/or sell
// copies of the Software, and to permit persons to whom the Software is
// furnished to do so, subject to the following conditions:
//
// The above copyright notice and this permission notice shall be included in all
// copies or substantial portions of the Software.
//
// THE SOFTWARE IS PROVIDED "AS IS", WITHOUT WARRANTY OF ANY KIND, EXPRESS OR
// IMPLIED, INCLUDING BUT NOT LIMITED TO THE WARRANTIES OF MERCHANTABILITY,
// FITNESS FOR A PARTICULAR PURPOSE AND NONINFRINGEMENT. IN NO EVENT SHALL THE
// AUTHORS OR COPYRIGHT HOLDERS BE LIABLE FOR ANY CLAIM, DAMAGES OR OTHER
// LIABILITY, WHETHER IN AN ACTION OF CONTRACT, TORT OR OTHERWISE, ARISING FROM,
// OUT OF OR IN CONNECTION WITH THE SOFTWARE OR THE USE OR OTHER DEALINGS IN THE
// SOFTWARE.

use {
	crate::{*, topology::Address},
	std::sync::{RwLock, atomic::{AtomicBool, Ordering}}
};

pub type EventListener = Box<dyn Fn(&Event) + Send + Sync>;

#[derive(Debug)]
pub enum Event<'a> {
	PoolCreated {
		options: &'a PoolOptions
	},
	PoolClosed,
	ConnectionCreated {
		connection_id: usize
	},
	ConnectionReady {
		connection_id: usize,
		address:       &'a Address
	},
	ConnectionClosed {
		connection_id: usize,
		reason:        ConnectionClosedReason
	},
	ConnectionCheckOutStarted,
	ConnectionCheckOutFailed {
		reason: ConnectionCheckOutFailedReason
	},
	ConnectionCheckedOut {
		connection_id: usize
	},
	ConnectionCheckedIn {
		connection_id: usize
	},
	PrimaryDiscovered {
		set_name: &'a str,
		address:  &'a Address
	},
	/// An operation failed and is retried once on a fresh connection.
	OperationRetried {
		connection_id: usize,
		failure:       &'a Error
	}
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum ConnectionCheckOutFailedReason {
	PoolClosed,
	Timeout,
	Error
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum ConnectionClosedReason {
	Stale,
	Idle,
	Error,
	PoolClosed
}

/// Registered event listeners, shared by the client, its pool and all connections.
#[derive(Default)]
pub struct Listeners {
	set:       AtomicBool,
	listeners: RwLock<Vec<EventListener>>
}

impl Listeners {
	pub fn add(&self, listener: impl Fn(&Event) + Send + Sync + 'static) -> Result<()> {
		self.set.store(true, Ordering::SeqCst);
		self.listeners.write()?.push(Box::new(listener));
		Ok(())
	}

	pub fn dispatch(&self, event: Event) -> Result<()> {
		if !self.set.load(Ordering::SeqCst) { return Ok(()); }
		for listener in self.listeners.read()?.iter() {
			listener(&event)
		}
		Ok(())
	}
}

impl std::fmt::Debug for Listeners {
	fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
		f.debug_struct("Listeners")
			.field("set", &self.set)
			.finish()
	}
}
