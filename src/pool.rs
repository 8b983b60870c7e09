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
	crate::{*, topology::Connection, apm::*},
	std::{
		sync::{Arc, Weak, Mutex, Condvar},
		time::{Duration, Instant},
		ops::{Deref, DerefMut},
		thread
	},
	log::{debug, warn}
};

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum PoolError {
	/// No connection became available within `wait_timeout`
	WaitTimeout,
	Closed
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct PoolStatus {
	/// Connections waiting in the pool
	pub idle:  usize,
	/// Connections owned by the pool, including checked out ones and ones being opened
	pub total: usize
}

/// A bounded pool of connections.
///
/// Connections are checked out for the duration of one logical operation and returned when
/// the `PooledConnection` is dropped.
#[derive(Debug, Clone)]
pub struct Pool(Arc<PoolInner>);

#[derive(Debug)]
pub struct PoolInner {
	options:   Arc<ClientOptions>,
	listeners: Arc<Listeners>,
	state:     Mutex<PoolState>,
	wait_lock: Condvar,
	monitor:   Arc<Monitor>
}

#[derive(Debug, Default)]
struct PoolState {
	/// Most recently used last
	idle:    Vec<Connection>,
	len:     usize,
	next_id: usize,
	closed:  bool
}

#[derive(Debug, Default)]
struct Monitor {
	stopped: Mutex<bool>,
	condvar: Condvar
}

impl Monitor {
	fn stop(&self) {
		if let Ok(mut stopped) = self.stopped.lock() {
			*stopped = true;
		}
		self.condvar.notify_all();
	}

	/// Waits for the next heartbeat, returns false once the monitor was stopped.
	fn wait(&self, timeout: Duration) -> bool {
		match self.stopped.lock() {
			Ok(guard) => match self.condvar.wait_timeout(guard, timeout) {
				Ok((stopped, _)) => !*stopped,
				Err(_) => false
			},
			Err(_) => false
		}
	}
}

impl Deref for Pool {
	type Target = PoolInner;

	fn deref(&self) -> &Self::Target {
		&self.0
	}
}

impl Pool {
	pub fn new(options: Arc<ClientOptions>, listeners: Arc<Listeners>) -> Result<Self> {
		let self_ = Self(Arc::new(PoolInner {
			options,
			listeners,
			state:     Mutex::new(PoolState::default()),
			wait_lock: Condvar::new(),
			monitor:   Arc::new(Monitor::default())
		}));

		if let Some(frequency) = self_.options.pool_options.heartbeat_frequency {
			let pool = Arc::downgrade(&self_.0);
			let monitor = self_.monitor.clone();
			thread::Builder::new()
				.name("pool-monitor".to_string())
				.spawn(move || run_monitor(pool, monitor, frequency))?;
		}

		self_.listeners.dispatch(Event::PoolCreated { options: &self_.options.pool_options })?;
		Ok(self_)
	}

	pub fn status(&self) -> Result<PoolStatus> {
		let state = self.state.lock()?;
		Ok(PoolStatus { idle: state.idle.len(), total: state.len })
	}

	/// Opens the connection for a slot that has already been counted in `len`.
	fn open(&self, id: usize) -> Result<Connection> {
		self.listeners.dispatch(Event::ConnectionCreated { connection_id: id })?;
		let mut conn = Connection::new(id, self.options.clone(), self.listeners.clone());
		match conn.connect() {
			Ok(()) => Ok(conn),
			Err(e) => {
				let mut state = self.state.lock()?;
				state.len -= 1;
				self.wait_lock.notify_one();
				Err(e)
			}
		}
	}

	fn check_out_failed(&self, reason: ConnectionCheckOutFailedReason, err: Error) -> Result<PooledConnection> {
		self.listeners.dispatch(Event::ConnectionCheckOutFailed { reason })?;
		Err(err)
	}

	/// Takes an idle connection, opens a new one if the pool is not full, or waits up to
	/// `wait_timeout` for a connection to be released.
	pub fn checkout(&self) -> Result<PooledConnection> {
		self.listeners.dispatch(Event::ConnectionCheckOutStarted)?;
		let deadline = Instant::now() + self.options.pool_options.wait_timeout;
		let mut state = self.state.lock()?;

		loop {
			if state.closed {
				return self.check_out_failed(ConnectionCheckOutFailedReason::PoolClosed, PoolError::Closed.into());
			}

			if let Some(conn) = state.idle.pop() {
				// close connection if it has been idle for too long
				if conn.is_idle() {
					state.len -= 1;
					self.listeners.dispatch(Event::ConnectionClosed {
						connection_id: conn.id,
						reason:        ConnectionClosedReason::Idle
					})?;
					continue;
				}

				self.listeners.dispatch(Event::ConnectionCheckedOut { connection_id: conn.id })?;
				return Ok(PooledConnection { conn: Some(conn), pool: self.clone() });
			}

			if state.len < self.options.pool_options.max_pool_size {
				state.len += 1;
				state.next_id += 1;
				let id = state.next_id;
				drop(state);

				return match self.open(id) {
					Ok(conn) => {
						self.listeners.dispatch(Event::ConnectionCheckedOut { connection_id: id })?;
						Ok(PooledConnection { conn: Some(conn), pool: self.clone() })
					}
					Err(e) => self.check_out_failed(ConnectionCheckOutFailedReason::Error, e)
				};
			}

			let now = Instant::now();
			if now >= deadline {
				return self.check_out_failed(ConnectionCheckOutFailedReason::Timeout, PoolError::WaitTimeout.into());
			}
			state = self.wait_lock.wait_timeout(state, deadline - now)?.0;
		}
	}

	fn release(&self, mut conn: Connection) -> Result<()> {
		let mut state = self.state.lock()?;

		let reason = if state.closed {
			Some(ConnectionClosedReason::PoolClosed)
		} else if conn.last_used().is_none() || conn.is_broken() {
			Some(ConnectionClosedReason::Error)
		} else {
			None
		};

		match reason {
			Some(reason) => {
				state.len -= 1;
				conn.close();
				self.listeners.dispatch(Event::ConnectionClosed { connection_id: conn.id, reason })?;
			}
			None => {
				self.listeners.dispatch(Event::ConnectionCheckedIn { connection_id: conn.id })?;
				state.idle.push(conn);
			}
		}

		self.wait_lock.notify_one();
		Ok(())
	}

	/// Opens connections until `min_pool_size` is reached. Failures are logged, not returned.
	pub fn fill(&self) -> Result<()> {
		loop {
			let id = {
				let mut state = self.state.lock()?;
				if state.closed || state.len >= self.options.pool_options.min_pool_size {
					return Ok(());
				}
				state.len += 1;
				state.next_id += 1;
				state.next_id
			};

			match self.open(id) {
				Ok(conn) => self.release(conn)?,
				Err(e) => {
					warn!("failed to open connection {} while filling the pool: {}", id, e);
					return Ok(());
				}
			}
		}
	}

	/// Closes idle connections unused for longer than `max_idle_time`, keeping at least
	/// `min_pool_size` connections. Returns the number of closed connections.
	pub fn reap_idle(&self) -> Result<usize> {
		let mut state = self.state.lock()?;
		let mut closed = 0;

		// oldest first
		while !state.idle.is_empty()
			&& state.len > self.options.pool_options.min_pool_size
			&& state.idle[0].is_idle() {
			let conn = state.idle.remove(0);
			state.len -= 1;
			closed += 1;
			self.listeners.dispatch(Event::ConnectionClosed {
				connection_id: conn.id,
				reason:        ConnectionClosedReason::Idle
			})?;
		}

		Ok(closed)
	}

	/// Closes all idle connections, connections still checked out are closed on release.
	pub fn close(&self) -> Result<()> {
		let mut state = self.state.lock()?;
		if state.closed {
			return Ok(());
		}

		state.closed = true;
		for conn in std::mem::take(&mut state.idle) {
			state.len -= 1;
			self.listeners.dispatch(Event::ConnectionClosed {
				connection_id: conn.id,
				reason:        ConnectionClosedReason::PoolClosed
			})?;
		}

		self.wait_lock.notify_all();
		self.monitor.stop();
		self.listeners.dispatch(Event::PoolClosed)
	}
}

impl Drop for PoolInner {
	fn drop(&mut self) {
		self.monitor.stop();
	}
}

fn run_monitor(pool: Weak<PoolInner>, monitor: Arc<Monitor>, frequency: Duration) {
	while monitor.wait(frequency) {
		let pool = match pool.upgrade() {
			None => break, // pool has been dropped, kill monitor
			Some(pool) => Pool(pool)
		};

		match pool.reap_idle() {
			Ok(0) => (),
			Ok(n) => debug!("pool monitor closed {} idle connections", n),
			Err(e) => warn!("pool monitor failed to reap idle connections: {}", e)
		}
	}
}

/// A checked out connection, returned to its pool when dropped.
#[derive(Debug)]
pub struct PooledConnection {
	/// Only taken on drop
	conn: Option<Connection>,
	pool: Pool
}

impl Drop for PooledConnection {
	fn drop(&mut self) {
		if let Some(conn) = self.conn.take() {
			if let Err(e) = self.pool.release(conn) {
				warn!("failed to release connection: {}", e);
			}
		}
	}
}

impl Deref for PooledConnection {
	type Target = Connection;

	fn deref(&self) -> &Self::Target {
		self.conn.as_ref().expect("connection already released")
	}
}

impl DerefMut for PooledConnection {
	fn deref_mut(&mut self) -> &mut Self::Target {
		self.conn.as_mut().expect("connection already released")
	}
}
