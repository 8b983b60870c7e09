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

#![allow(clippy::float_cmp)]

use {
	crate::{*, topology::Address},
	std::{io::{self, Read, Write}, net::{TcpStream, ToSocketAddrs}, time::Duration, ops::BitOr},
	serde::Deserialize,
	bson::Document
};

pub const HEADER_SIZE:       usize = 16;
pub const REPLY_HEADER_SIZE: usize = 20;
pub const MAX_MESSAGE_SIZE:  usize = 48_000_000;
/// Request ids below this value are reserved.
pub const MIN_REQUEST_ID:    i32   = 3;
pub const MAX_REQUEST_ID:    i32   = 99_999_999;

#[derive(Debug)]
pub enum InvalidReplyError {
	/// The opcode was not REPLY
	OpCode(i32),
	/// Response_to did not match request_id
	ResponseTo { expected: i32, received: i32 },
	/// Message length out of bounds
	Length(i32),
	/// Number returned did not match the documents in the payload
	DocumentCount { expected: i32, received: usize },
	/// The reply to a command did not contain a document
	MissingDocument,
	/// A field the reply must contain was missing or of the wrong type
	MissingField(&'static str)
}

#[repr(i32)]
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum OpCode {
	Reply       = 1,
	Update      = 2001,
	Insert      = 2002,
	Query       = 2004,
	GetMore     = 2005,
	Delete      = 2006,
	KillCursors = 2007
}

impl OpCode {
	pub(crate) fn from_i32(v: i32) -> Option<Self> {
		Some(match v {
			1    => Self::Reply,
			2001 => Self::Update,
			2002 => Self::Insert,
			2004 => Self::Query,
			2005 => Self::GetMore,
			2006 => Self::Delete,
			2007 => Self::KillCursors,
			_    => return None
		})
	}
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct Header {
	pub message_length: i32,
	pub request_id:     i32,
	pub response_to:    i32,
	pub op_code:        OpCode
}

impl Header {
	fn read(reader: &mut impl Read) -> Result<Self> {
		let mut buf = [0u8; HEADER_SIZE];
		reader.read_exact(&mut buf)?;
		Self::copy_from_slice(&buf)
	}

	fn copy_to_slice(self, slice: &mut [u8]) {
		slice[0..4].copy_from_slice(&self.message_length.to_le_bytes());
		slice[4..8].copy_from_slice(&self.request_id.to_le_bytes());
		slice[8..12].copy_from_slice(&self.response_to.to_le_bytes());
		slice[12..16].copy_from_slice(&(self.op_code as i32).to_le_bytes());
	}

	fn copy_from_slice(buf: &[u8]) -> Result<Self> {
		let op_code = i32::from_le_bytes([buf[12], buf[13], buf[14], buf[15]]);
		Ok(Self {
			message_length: i32::from_le_bytes([buf[0], buf[1], buf[2],  buf[3]]),
			request_id:     i32::from_le_bytes([buf[4], buf[5], buf[6],  buf[7]]),
			response_to:    i32::from_le_bytes([buf[8], buf[9], buf[10], buf[11]]),
			op_code:        OpCode::from_i32(op_code)
				.ok_or(Error::InvalidReply(InvalidReplyError::OpCode(op_code)))?
		})
	}
}

#[derive(Debug, Copy, Clone, Default, Eq, PartialEq)]
pub struct QueryFlags(pub i32);

impl QueryFlags {
	pub const TAILABLE_CURSOR:   Self = Self(1 << 1);
	/// Set on every query this client sends.
	pub const SLAVE_OK:          Self = Self(1 << 2);
	pub const NO_CURSOR_TIMEOUT: Self = Self(1 << 4);
	pub const AWAIT_DATA:        Self = Self(1 << 5);
	pub const EXHAUST:           Self = Self(1 << 6);
	pub const PARTIAL:           Self = Self(1 << 7);

	pub fn contains(self, other: Self) -> bool {
		self.0 & other.0 == other.0
	}
}

impl BitOr for QueryFlags {
	type Output = Self;

	fn bitor(self, rhs: Self) -> Self {
		Self(self.0 | rhs.0)
	}
}

#[derive(Debug, Copy, Clone, Default, Eq, PartialEq)]
pub struct ResponseFlags(pub i32);

impl ResponseFlags {
	pub const CURSOR_NOT_FOUND:   Self = Self(1);
	pub const QUERY_FAILURE:      Self = Self(1 << 1);
	pub const SHARD_CONFIG_STALE: Self = Self(1 << 2);
	pub const AWAIT_CAPABLE:      Self = Self(1 << 3);

	pub fn contains(self, other: Self) -> bool {
		self.0 & other.0 == other.0
	}
}

/// A request in the legacy wire format.
#[derive(Debug, Copy, Clone)]
pub enum Message<'a> {
	Query {
		flags:     QueryFlags,
		namespace: &'a str,
		skip:      i32,
		limit:     i32,
		query:     &'a Document,
		fields:    Option<&'a Document>
	},
	GetMore {
		namespace: &'a str,
		limit:     i32,
		cursor_id: i64
	},
	Insert {
		namespace:         &'a str,
		documents:         &'a [Document],
		continue_on_error: bool
	},
	Update {
		namespace: &'a str,
		selector:  &'a Document,
		update:    &'a Document,
		upsert:    bool,
		multi:     bool
	},
	Delete {
		namespace: &'a str,
		selector:  &'a Document,
		single:    bool
	},
	KillCursors {
		cursor_ids: &'a [i64]
	}
}

impl Message<'_> {
	pub fn op_code(&self) -> OpCode {
		match self {
			Self::Query { .. }       => OpCode::Query,
			Self::GetMore { .. }     => OpCode::GetMore,
			Self::Insert { .. }      => OpCode::Insert,
			Self::Update { .. }      => OpCode::Update,
			Self::Delete { .. }      => OpCode::Delete,
			Self::KillCursors { .. } => OpCode::KillCursors
		}
	}

	fn write_body(&self, buf: &mut Vec<u8>) -> Result<()> {
		match *self {
			Self::Query { flags, namespace, skip, limit, query, fields } => {
				buf.extend_from_slice(&(flags | QueryFlags::SLAVE_OK).0.to_le_bytes());
				write_cstring(buf, namespace);
				buf.extend_from_slice(&skip.to_le_bytes());
				buf.extend_from_slice(&limit.to_le_bytes());
				query.to_writer(&mut *buf)?;
				if let Some(fields) = fields {
					fields.to_writer(&mut *buf)?;
				}
			}
			Self::GetMore { namespace, limit, cursor_id } => {
				buf.extend_from_slice(&0i32.to_le_bytes());
				write_cstring(buf, namespace);
				buf.extend_from_slice(&limit.to_le_bytes());
				buf.extend_from_slice(&cursor_id.to_le_bytes());
			}
			Self::Insert { namespace, documents, continue_on_error } => {
				buf.extend_from_slice(&(continue_on_error as i32).to_le_bytes());
				write_cstring(buf, namespace);
				for doc in documents {
					doc.to_writer(&mut *buf)?;
				}
			}
			Self::Update { namespace, selector, update, upsert, multi } => {
				buf.extend_from_slice(&0i32.to_le_bytes());
				write_cstring(buf, namespace);
				buf.extend_from_slice(&(upsert as i32 | (multi as i32) << 1).to_le_bytes());
				selector.to_writer(&mut *buf)?;
				update.to_writer(&mut *buf)?;
			}
			Self::Delete { namespace, selector, single } => {
				buf.extend_from_slice(&0i32.to_le_bytes());
				write_cstring(buf, namespace);
				buf.extend_from_slice(&(single as i32).to_le_bytes());
				selector.to_writer(&mut *buf)?;
			}
			Self::KillCursors { cursor_ids } => {
				buf.extend_from_slice(&0i32.to_le_bytes());
				buf.extend_from_slice(&(cursor_ids.len() as i32).to_le_bytes());
				for id in cursor_ids {
					buf.extend_from_slice(&id.to_le_bytes());
				}
			}
		}
		Ok(())
	}
}

fn write_cstring(buf: &mut Vec<u8>, s: &str) {
	buf.extend_from_slice(s.as_bytes());
	buf.push(0);
}

/// A decoded OP_REPLY.
#[derive(Debug, Clone, PartialEq)]
pub struct Reply {
	pub flags:           ResponseFlags,
	pub cursor_id:       i64,
	pub starting_from:   i32,
	pub number_returned: i32,
	pub documents:       Vec<Document>
}

impl Reply {
	/// Parses the body of a reply, i.e. everything after the message header.
	pub fn parse(body: &[u8]) -> Result<Self> {
		if body.len() < REPLY_HEADER_SIZE {
			return Err(InvalidReplyError::Length((body.len() + HEADER_SIZE) as i32).into());
		}

		let number_returned = i32::from_le_bytes([body[16], body[17], body[18], body[19]]);
		let mut payload = &body[REPLY_HEADER_SIZE..];
		// every document takes at least 5 bytes, the count alone is not trusted
		let mut documents = Vec::with_capacity((number_returned.max(0) as usize).min(payload.len() / 5));
		while !payload.is_empty() {
			documents.push(Document::from_reader(&mut payload)?);
		}

		if documents.len() != number_returned.max(0) as usize {
			return Err(InvalidReplyError::DocumentCount {
				expected: number_returned,
				received: documents.len()
			}.into());
		}

		let mut cursor_id = [0u8; 8];
		cursor_id.copy_from_slice(&body[4..12]);

		Ok(Self {
			flags:         ResponseFlags(i32::from_le_bytes([body[0], body[1], body[2], body[3]])),
			cursor_id:     i64::from_le_bytes(cursor_id),
			starting_from: i32::from_le_bytes([body[12], body[13], body[14], body[15]]),
			number_returned,
			documents
		})
	}

	/// Turns the failure flags of this reply into errors.
	pub fn check(self) -> Result<Self> {
		if self.flags.contains(ResponseFlags::CURSOR_NOT_FOUND) {
			Err(CursorError::NotFound(self.cursor_id).into())
		} else if self.flags.contains(ResponseFlags::QUERY_FAILURE) {
			let doc = self.documents.first();
			Err(CursorError::QueryFailure {
				code:    doc.and_then(|doc| doc.get_i32("code").ok()),
				message: doc.and_then(|doc| doc.get_str("$err").ok())
					.unwrap_or("query failure")
					.to_string()
			}.into())
		} else {
			Ok(self)
		}
	}

	pub fn into_first(self) -> Result<Document> {
		self.documents.into_iter().next()
			.ok_or(Error::InvalidReply(InvalidReplyError::MissingDocument))
	}
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenericReply {
	#[serde(default)]
	pub ok:     f64,
	pub errmsg: Option<String>,
	pub code:   Option<i32>
}

/// Returns the command reply if it reports success, an `Operation` error otherwise.
pub fn check_ok(doc: Document) -> Result<Document> {
	let reply: GenericReply = bson::from_document(doc.clone())?;
	if reply.ok == 1f64 {
		Ok(doc)
	} else {
		Err(reply.into())
	}
}

/// A byte stream a channel runs on.
pub trait Stream: Read + Write {
	fn set_read_timeout(&mut self, timeout: Option<Duration>) -> io::Result<()>;
}

impl Stream for TcpStream {
	fn set_read_timeout(&mut self, timeout: Option<Duration>) -> io::Result<()> {
		TcpStream::set_read_timeout(self, timeout)
	}
}

/// A single connection to a server, exchanging one request and its reply at a time.
///
/// A channel is marked broken once a transport error or a protocol violation occurred,
/// after which every operation fails.
#[derive(Debug)]
pub struct Channel<S: Stream = TcpStream> {
	stream:          S,
	read_timeout:    Option<Duration>,
	next_request_id: i32,
	broken:          bool
}

impl Channel<TcpStream> {
	/// Connects to a server, trying every address the host name resolves to.
	pub fn connect(address: &Address, connect_timeout: Duration, socket_timeout: Duration) -> Result<Self> {
		let mut last_err = None;
		for addr in (address.host.as_str(), address.port).to_socket_addrs()? {
			match TcpStream::connect_timeout(&addr, connect_timeout) {
				Ok(stream) => {
					let timeout = Some(socket_timeout).filter(|t| *t != Duration::from_secs(0));
					stream.set_nodelay(true)?;
					TcpStream::set_read_timeout(&stream, timeout)?;
					stream.set_write_timeout(timeout)?;
					let mut channel = Self::new(stream);
					channel.read_timeout = timeout;
					return Ok(channel);
				}
				Err(e) => last_err = Some(e)
			}
		}

		Err(last_err.unwrap_or_else(|| io::Error::new(
			io::ErrorKind::NotFound, format!("`{}` did not resolve to any address", address))).into())
	}
}

impl<S: Stream> Channel<S> {
	pub fn new(stream: S) -> Self {
		Self {
			stream,
			read_timeout:    None,
			next_request_id: MIN_REQUEST_ID,
			broken:          false
		}
	}

	pub fn is_broken(&self) -> bool {
		self.broken
	}

	pub fn get_ref(&self) -> &S {
		&self.stream
	}

	/// Runs `f` with a different read timeout, restoring the channel's own timeout afterwards.
	pub fn with_read_timeout<T>(
		&mut self,
		timeout: Option<Duration>,
		f:       impl FnOnce(&mut Self) -> Result<T>
	) -> Result<T> {
		let timeout = match timeout {
			Some(timeout) if Some(timeout) != self.read_timeout => timeout,
			_ => return f(self)
		};

		let result = self.stream.set_read_timeout(Some(timeout))
			.map_err(Error::from)
			.and_then(|_| f(self));
		let default = self.read_timeout;
		let result = match self.stream.set_read_timeout(default) {
			Ok(()) => result,
			Err(e) => result.and(Err(e.into()))
		};
		self.poison(result)
	}

	fn next_request_id(&mut self) -> i32 {
		if self.next_request_id > MAX_REQUEST_ID {
			self.next_request_id = MIN_REQUEST_ID;
		}
		let id = self.next_request_id;
		self.next_request_id += 1;
		id
	}

	/// Appends the framed message to `buf`, returning its request id.
	fn frame(&mut self, buf: &mut Vec<u8>, message: &Message) -> Result<i32> {
		let start = buf.len();
		buf.extend_from_slice(&[0u8; HEADER_SIZE]);
		message.write_body(buf)?;

		let request_id = self.next_request_id();
		Header {
			message_length: (buf.len() - start) as i32,
			request_id,
			response_to:    0,
			op_code:        message.op_code()
		}.copy_to_slice(&mut buf[start..start + HEADER_SIZE]);

		Ok(request_id)
	}

	fn write_frames(&mut self, buf: &[u8]) -> Result<()> {
		if self.broken {
			return Err(io::Error::new(io::ErrorKind::NotConnected, "channel is broken").into());
		}
		self.stream.write_all(buf)?;
		self.stream.flush()?;
		Ok(())
	}

	fn poison<T>(&mut self, result: Result<T>) -> Result<T> {
		if matches!(&result, Err(e) if e.is_fatal()) {
			self.broken = true;
		}
		result
	}

	/// Sends a message, returning its request id.
	pub fn send(&mut self, message: &Message) -> Result<i32> {
		let result = self.send_inner(message);
		self.poison(result)
	}

	fn send_inner(&mut self, message: &Message) -> Result<i32> {
		let mut buf = Vec::new();
		let request_id = self.frame(&mut buf, message)?;
		self.write_frames(&buf)?;
		Ok(request_id)
	}

	/// Reads the reply to the request with the given id. Any other reply is fatal.
	pub fn receive(&mut self, request_id: i32) -> Result<Reply> {
		let result = self.receive_inner(request_id);
		self.poison(result)
	}

	fn receive_inner(&mut self, request_id: i32) -> Result<Reply> {
		let header = Header::read(&mut self.stream)?;

		if header.response_to != request_id {
			return Err(InvalidReplyError::ResponseTo {
				expected: request_id,
				received: header.response_to
			}.into());
		} else if header.op_code != OpCode::Reply {
			return Err(InvalidReplyError::OpCode(header.op_code as i32).into());
		} else if header.message_length < (HEADER_SIZE + REPLY_HEADER_SIZE) as i32
			|| header.message_length as usize > MAX_MESSAGE_SIZE {
			return Err(InvalidReplyError::Length(header.message_length).into());
		}

		let mut body = vec![0u8; header.message_length as usize - HEADER_SIZE];
		self.stream.read_exact(&mut body)?;
		Reply::parse(&body)
	}

	pub fn send_receive(&mut self, message: &Message) -> Result<Reply> {
		let request_id = self.send(message)?;
		self.receive(request_id)
	}

	pub fn query(
		&mut self,
		namespace: &str,
		query:     &Document,
		fields:    Option<&Document>,
		skip:      i32,
		limit:     i32
	) -> Result<Reply> {
		self.send_receive(&Message::Query {
			flags: QueryFlags::default(),
			namespace,
			skip,
			limit,
			query,
			fields
		})?.check()
	}

	pub fn get_more(&mut self, namespace: &str, limit: i32, cursor_id: i64) -> Result<Reply> {
		self.send_receive(&Message::GetMore { namespace, limit, cursor_id })?.check()
	}

	/// Runs a command against `db`, returning the raw reply document.
	pub fn command(&mut self, db: &str, command: &Document) -> Result<Document> {
		self.query(&format!("{}.$cmd", db), command, None, 0, -1)?.into_first()
	}

	/// Sends a write message. If the write concern is acknowledged, a `getLastError` command
	/// is sent along with it and its reply is returned.
	pub fn write(&mut self, message: &Message, concern: &WriteConcern) -> Result<Option<Document>> {
		let result = self.write_inner(message, concern);
		self.poison(result)
	}

	fn write_inner(&mut self, message: &Message, concern: &WriteConcern) -> Result<Option<Document>> {
		let mut buf = Vec::new();
		self.frame(&mut buf, message)?;

		let get_last_error = match concern.get_last_error() {
			Some(cmd) => cmd,
			None => {
				self.write_frames(&buf)?;
				return Ok(None);
			}
		};

		let request_id = self.frame(&mut buf, &Message::Query {
			flags:     QueryFlags::default(),
			namespace: "admin.$cmd",
			skip:      0,
			limit:     -1,
			query:     &get_last_error,
			fields:    None
		})?;

		self.write_frames(&buf)?;
		self.receive_inner(request_id)?.check()?.into_first().map(Some)
	}

	pub fn kill_cursors(&mut self, cursor_ids: &[i64]) -> Result<()> {
		self.send(&Message::KillCursors { cursor_ids }).map(|_| ())
	}
}
