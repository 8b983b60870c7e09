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
	crate::{*, wire::{Channel, Stream, check_ok}, apm::{Event, Listeners}},
	std::{str::FromStr, sync::Arc, time::Instant},
	serde::Deserialize,
	bson::{doc, Document},
	rand::seq::SliceRandom,
	log::{debug, info, warn}
};

/// A server address, `host[:port]`.
#[derive(Debug, Clone, Eq, PartialEq, Hash)]
pub struct Address {
	pub host: String,
	pub port: u16
}

impl FromStr for Address {
	type Err = Error;

	fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
		let invalid = || Error::InvalidClientOptions(ClientOptionsParseError::InvalidAddress(s.to_string()));

		let (host, port) = match s.rfind(':') {
			Some(i) => (&s[..i], s[i + 1..].parse::<u16>().ok()
				.filter(|port| *port != 0)
				.ok_or_else(invalid)?),
			None => (s, DEFAULT_MONGO_PORT)
		};

		if host.is_empty() || !host.chars()
			.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '.' || c == '-') {
			return Err(invalid());
		}

		Ok(Self { host: host.to_string(), port })
	}
}

impl std::fmt::Display for Address {
	fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
		write!(f, "{}:{}", self.host, self.port)
	}
}

#[derive(Debug)]
pub enum ConnectionError {
	/// None of the configured hosts could be connected to
	NoReachableHost,
	/// A member reported a different replica set than the configured one
	SetNameMismatch { expected: String, found: Option<String> },
	/// The replica set has no primary, or the primary is not a listed member
	NoPrimary,
	/// The server rejected the credential
	AuthenticationFailed(Address)
}

/// The hosts a connection may be bound to.
#[derive(Debug, Clone, Default, Eq, PartialEq)]
pub struct Topology {
	pub hosts:    Vec<Address>,
	pub set_name: Option<String>,
	/// The primary found by the last discovery.
	pub primary:  Option<Address>
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct IsMasterReply {
	set_name: Option<String>,
	#[serde(default)]
	hosts:    Vec<String>,
	#[serde(default)]
	passives: Vec<String>,
	primary:  Option<String>
}

/// Asks a replica set member for the current primary.
pub fn discover<S: Stream>(channel: &mut Channel<S>, set_name: &str) -> Result<Address> {
	let reply: IsMasterReply = bson::from_document(
		check_ok(channel.command("admin", &doc! { "isMaster": 1 })?)?)?;

	if reply.set_name.as_deref() != Some(set_name) {
		return Err(ConnectionError::SetNameMismatch {
			expected: set_name.to_string(),
			found:    reply.set_name
		}.into());
	}

	let primary = reply.primary.ok_or(Error::Connection(ConnectionError::NoPrimary))?;
	reply.hosts.iter()
		.chain(&reply.passives)
		.find(|member| **member == primary)
		.ok_or(Error::Connection(ConnectionError::NoPrimary))?
		.parse()
}

/// Authenticates the channel if the credential has a user name.
#[cfg(feature = "auth")]
pub fn login<S: Stream>(channel: &mut Channel<S>, credential: &Credential, address: &Address) -> Result<()> {
	if credential.username.is_some() && !auth::authenticate(channel, credential)? {
		return Err(ConnectionError::AuthenticationFailed(address.clone()).into());
	}
	Ok(())
}

#[cfg(not(feature = "auth"))]
pub fn login<S: Stream>(_channel: &mut Channel<S>, credential: &Credential, _address: &Address) -> Result<()> {
	match credential.username {
		Some(_) => Err(Error::AuthUnsupported),
		None    => Ok(())
	}
}

/// A connection to a single server or to the primary of a replica set.
///
/// The channel is (re)established lazily by `active`. Operations run through `execute`
/// get one retry on a fresh channel, a second failure resets `last_used`, which makes
/// the pool discard the connection on release.
#[derive(Debug)]
pub struct Connection {
	pub id:    usize,
	options:   Arc<ClientOptions>,
	listeners: Arc<Listeners>,
	topology:  Topology,
	channel:   Option<Channel>,
	address:   Option<Address>,
	last_used: Option<Instant>
}

impl Connection {
	pub fn new(id: usize, options: Arc<ClientOptions>, listeners: Arc<Listeners>) -> Self {
		Self {
			id,
			topology:  Topology {
				hosts:    options.hosts.clone(),
				set_name: options.replica_set.clone(),
				primary:  None
			},
			options,
			listeners,
			channel:   None,
			address:   None,
			last_used: None
		}
	}

	pub fn options(&self) -> &ClientOptions {
		&self.options
	}

	pub fn topology(&self) -> &Topology {
		&self.topology
	}

	/// The address of the server the channel is connected to.
	pub fn address(&self) -> Option<&Address> {
		self.address.as_ref()
	}

	pub fn last_used(&self) -> Option<Instant> {
		self.last_used
	}

	pub fn is_connected(&self) -> bool {
		self.channel.is_some()
	}

	/// Returns true if the channel is gone or can no longer be used.
	pub fn is_broken(&self) -> bool {
		self.channel.as_ref().map_or(true, Channel::is_broken)
	}

	fn open(&self, address: &Address, credential: &Credential) -> Result<Channel> {
		let mut channel = Channel::connect(
			address,
			self.options.pool_options.connect_timeout,
			self.options.socket_timeout
		)?;
		login(&mut channel, credential, address)?;
		Ok(channel)
	}

	fn shuffled_hosts(&self) -> Vec<Address> {
		let mut hosts = self.topology.hosts.clone();
		hosts.shuffle(&mut rand::thread_rng());
		hosts
	}

	fn connect_first_available(&self) -> Result<(Channel, Address)> {
		let mut last_err = None;
		for address in self.shuffled_hosts() {
			match self.open(&address, &self.options.credential) {
				Ok(channel) => return Ok((channel, address)),
				Err(e) => {
					debug!("connection {} failed to connect to `{}`: {}", self.id, address, e);
					last_err = Some(e);
				}
			}
		}
		Err(last_err.unwrap_or(Error::Connection(ConnectionError::NoReachableHost)))
	}

	fn connect_primary(&mut self, set_name: &str) -> Result<(Channel, Address)> {
		for address in self.shuffled_hosts() {
			let mut aux = match self.open(&address, self.options.discovery_credential()) {
				Ok(channel) => channel,
				Err(e) => {
					debug!("connection {} failed to reach replica set member `{}`: {}", self.id, address, e);
					continue;
				}
			};

			let primary = discover(&mut aux, set_name)?;
			drop(aux);

			let channel = self.open(&primary, &self.options.credential)?;
			info!("connection {} discovered primary `{}` of replica set `{}`", self.id, primary, set_name);
			self.listeners.dispatch(Event::PrimaryDiscovered { set_name, address: &primary })?;
			self.topology.primary = Some(primary.clone());
			return Ok((channel, primary));
		}
		Err(ConnectionError::NoReachableHost.into())
	}

	/// Opens a new channel, replacing the current one.
	pub fn connect(&mut self) -> Result<()> {
		self.close();

		let (channel, address) = match self.topology.set_name.clone() {
			Some(set_name) => self.connect_primary(&set_name)?,
			None => self.connect_first_available()?
		};

		self.listeners.dispatch(Event::ConnectionReady { connection_id: self.id, address: &address })?;
		self.channel = Some(channel);
		self.address = Some(address);
		self.last_used = Some(Instant::now());
		Ok(())
	}

	pub fn reconnect(&mut self) -> Result<()> {
		let id = self.id;
		self.connect().map_err(|e| {
			warn!("connection {} failed to reconnect: {}", id, e);
			e
		})
	}

	pub fn close(&mut self) {
		self.channel = None;
		self.address = None;
	}

	/// Returns true if the connection has not been used for longer than `max_idle_time`.
	pub fn is_idle(&self) -> bool {
		let max_idle_time = self.options.pool_options.max_idle_time;
		max_idle_time.as_nanos() != 0
			&& self.last_used.map_or(false, |ts| ts.elapsed() > max_idle_time)
	}

	/// Returns the channel, reconnecting first if it is missing, broken or has been idle
	/// for too long.
	pub fn active(&mut self) -> Result<&mut Channel> {
		if self.is_broken() || self.is_idle() {
			self.reconnect()?;
		}

		self.last_used = Some(Instant::now());
		self.channel.as_mut().ok_or(Error::Connection(ConnectionError::NoReachableHost))
	}

	/// Runs `op` on the active channel. On failure the connection is reestablished and
	/// `op` runs once more.
	pub fn execute<T>(&mut self, mut op: impl FnMut(&mut Channel) -> Result<T>) -> Result<T> {
		let err = match self.active().and_then(&mut op) {
			Ok(v) => return Ok(v),
			Err(e) => e
		};

		warn!("operation on connection {} failed, retrying: {}", self.id, err);
		self.listeners.dispatch(Event::OperationRetried { connection_id: self.id, failure: &err })?;

		let result = self.reconnect().and_then(|_| match self.channel.as_mut() {
			Some(channel) => op(channel),
			None => Err(ConnectionError::NoReachableHost.into())
		});

		match result {
			Ok(_) => self.last_used = Some(Instant::now()),
			Err(_) => self.last_used = None
		}
		result
	}

	/// Runs a command against `db`, failing if the server does not report success.
	pub fn command(&mut self, db: &str, command: &Document) -> Result<Document> {
		self.execute(|channel| check_ok(channel.command(db, command)?))
	}
}
