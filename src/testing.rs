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

//! Scripted peers speaking the legacy wire protocol, used by the unit tests.

use {
	crate::{wire::{HEADER_SIZE, OpCode, Stream}, topology::Address},
	std::{
		io::{self, Read, Write, Cursor},
		net::{TcpListener, TcpStream, SocketAddr},
		sync::{Arc, Mutex},
		thread,
		time::Duration
	},
	bson::{doc, Document}
};

/// A stream replaying scripted replies and recording everything written to it.
#[derive(Debug, Default)]
pub struct MockStream {
	input:             Cursor<Vec<u8>>,
	pub output:        Vec<u8>,
	pub read_timeouts: Vec<Option<Duration>>
}

impl MockStream {
	pub fn new(replies: Vec<Vec<u8>>) -> Self {
		Self {
			input:         Cursor::new(replies.concat()),
			output:        Vec::new(),
			read_timeouts: Vec::new()
		}
	}

	/// Decodes all requests written so far.
	pub fn requests(&self) -> Vec<Request> {
		let mut reader = &self.output[..];
		let mut requests = Vec::new();
		while !reader.is_empty() {
			requests.push(read_request(&mut reader).expect("malformed request"));
		}
		requests
	}
}

impl Read for MockStream {
	fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
		self.input.read(buf)
	}
}

impl Write for MockStream {
	fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
		self.output.extend_from_slice(buf);
		Ok(buf.len())
	}

	fn flush(&mut self) -> io::Result<()> {
		Ok(())
	}
}

impl Stream for MockStream {
	fn set_read_timeout(&mut self, timeout: Option<Duration>) -> io::Result<()> {
		self.read_timeouts.push(timeout);
		Ok(())
	}
}

/// A decoded request. Fields not present in the message keep their default value.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Request {
	pub request_id: i32,
	pub op_code:    i32,
	pub flags:      i32,
	pub namespace:  String,
	pub skip:       i32,
	pub limit:      i32,
	pub cursor_id:  i64,
	pub documents:  Vec<Document>
}

impl Request {
	pub fn command_name(&self) -> Option<&str> {
		self.documents.first()
			.and_then(|doc| doc.keys().next())
			.map(String::as_str)
	}

	pub fn is_op(&self, op_code: OpCode) -> bool {
		self.op_code == op_code as i32
	}
}

pub fn read_request(reader: &mut impl Read) -> io::Result<Request> {
	let mut header = [0u8; HEADER_SIZE];
	reader.read_exact(&mut header)?;
	let mut header = &header[..];
	let length = read_i32(&mut header) as usize;
	let mut request = Request {
		request_id: read_i32(&mut header),
		..Request::default()
	};
	read_i32(&mut header);
	request.op_code = read_i32(&mut header);

	let mut body = vec![0u8; length - HEADER_SIZE];
	reader.read_exact(&mut body)?;
	let mut body = &body[..];

	match OpCode::from_i32(request.op_code) {
		Some(OpCode::Query) => {
			request.flags = read_i32(&mut body);
			request.namespace = read_cstring(&mut body);
			request.skip = read_i32(&mut body);
			request.limit = read_i32(&mut body);
			request.documents = read_documents(&mut body);
		}
		Some(OpCode::GetMore) => {
			read_i32(&mut body);
			request.namespace = read_cstring(&mut body);
			request.limit = read_i32(&mut body);
			request.cursor_id = read_i64(&mut body);
		}
		Some(OpCode::Insert) => {
			request.flags = read_i32(&mut body);
			request.namespace = read_cstring(&mut body);
			request.documents = read_documents(&mut body);
		}
		Some(OpCode::Update) | Some(OpCode::Delete) => {
			read_i32(&mut body);
			request.namespace = read_cstring(&mut body);
			request.flags = read_i32(&mut body);
			request.documents = read_documents(&mut body);
		}
		Some(OpCode::KillCursors) => {
			read_i32(&mut body);
			read_i32(&mut body);
			request.cursor_id = read_i64(&mut body);
		}
		_ => ()
	}

	Ok(request)
}

fn read_i32(buf: &mut &[u8]) -> i32 {
	let (value, rest) = buf.split_at(4);
	*buf = rest;
	i32::from_le_bytes([value[0], value[1], value[2], value[3]])
}

fn read_i64(buf: &mut &[u8]) -> i64 {
	let (value, rest) = buf.split_at(8);
	*buf = rest;
	let mut bytes = [0u8; 8];
	bytes.copy_from_slice(value);
	i64::from_le_bytes(bytes)
}

fn read_cstring(buf: &mut &[u8]) -> String {
	let end = buf.iter().position(|b| *b == 0).expect("unterminated cstring");
	let s = String::from_utf8(buf[..end].to_vec()).expect("invalid cstring");
	*buf = &buf[end + 1..];
	s
}

fn read_documents(buf: &mut &[u8]) -> Vec<Document> {
	let mut documents = Vec::new();
	while !buf.is_empty() {
		documents.push(Document::from_reader(&mut *buf).expect("invalid document"));
	}
	documents
}

pub fn reply(response_to: i32, cursor_id: i64, documents: &[Document]) -> Vec<u8> {
	reply_with_flags(response_to, 0, cursor_id, documents)
}

pub fn reply_with_flags(response_to: i32, flags: i32, cursor_id: i64, documents: &[Document]) -> Vec<u8> {
	let mut body = Vec::new();
	body.extend_from_slice(&flags.to_le_bytes());
	body.extend_from_slice(&cursor_id.to_le_bytes());
	body.extend_from_slice(&0i32.to_le_bytes());
	body.extend_from_slice(&(documents.len() as i32).to_le_bytes());
	for doc in documents {
		doc.to_writer(&mut body).expect("failed to encode document");
	}

	let mut message = Vec::with_capacity(HEADER_SIZE + body.len());
	message.extend_from_slice(&((HEADER_SIZE + body.len()) as i32).to_le_bytes());
	message.extend_from_slice(&1i32.to_le_bytes());
	message.extend_from_slice(&response_to.to_le_bytes());
	message.extend_from_slice(&(OpCode::Reply as i32).to_le_bytes());
	message.extend_from_slice(&body);
	message
}

/// A server on the loopback interface answering each request with the reply returned by
/// the handler. The handler gets the index of the connection the request arrived on and
/// closes the connection by returning `None`.
pub struct FakeServer {
	pub address: Address,
	peers:       Arc<Mutex<Vec<SocketAddr>>>,
	markers:     Mutex<Vec<SocketAddr>>,
	requests:    Arc<Mutex<Vec<Request>>>
}

impl FakeServer {
	pub fn spawn<F>(handler: F) -> Self
	where F: Fn(usize, &Request) -> Option<Vec<u8>> + Send + Sync + 'static {
		let listener = TcpListener::bind("127.0.0.1:0").expect("failed to bind");
		let port = listener.local_addr().expect("no local address").port();
		let peers = Arc::new(Mutex::new(Vec::new()));
		let requests = Arc::new(Mutex::new(Vec::new()));
		let handler = Arc::new(handler);

		let accepted = peers.clone();
		let recorded = requests.clone();
		thread::spawn(move || {
			for stream in listener.incoming() {
				let mut stream = match stream {
					Ok(stream) => stream,
					Err(_) => break
				};
				let index = {
					let mut accepted = accepted.lock().expect("poisoned");
					accepted.push(stream.peer_addr().expect("no peer address"));
					accepted.len() - 1
				};
				let handler = handler.clone();
				let recorded = recorded.clone();
				thread::spawn(move || {
					while let Ok(request) = read_request(&mut stream) {
						recorded.lock().expect("poisoned").push(request.clone());
						match handler(index, &request) {
							Some(reply) => if stream.write_all(&reply).is_err() { break },
							None => break
						}
					}
				});
			}
		});

		Self {
			address: Address { host: "127.0.0.1".to_string(), port },
			peers,
			markers: Mutex::new(Vec::new()),
			requests
		}
	}

	/// A server acknowledging every command and every write.
	pub fn ok() -> Self {
		Self::spawn(|_, request| Some(ok_reply(request)))
	}

	/// Number of client connections accepted so far.
	///
	/// Opens a marker connection first and waits until it is accepted. Pending connections are
	/// accepted in order, so by then every connection established before has been counted.
	/// The marker takes a connection index.
	pub fn connection_count(&self) -> usize {
		let marker = TcpStream::connect(("127.0.0.1", self.address.port)).expect("failed to connect");
		let local = marker.local_addr().expect("no local address");
		self.markers.lock().expect("poisoned").push(local);

		while !self.peers.lock().expect("poisoned").contains(&local) {
			thread::sleep(Duration::from_millis(1));
		}

		let markers = self.markers.lock().expect("poisoned");
		self.peers.lock().expect("poisoned").iter()
			.filter(|peer| !markers.contains(peer))
			.count()
	}

	/// All requests received so far, on any connection.
	pub fn requests(&self) -> Vec<Request> {
		self.requests.lock().expect("poisoned").clone()
	}
}

/// `{ok: 1}` for queries, nothing for messages without a reply.
pub fn ok_reply(request: &Request) -> Vec<u8> {
	if request.is_op(OpCode::Query) || request.is_op(OpCode::GetMore) {
		reply(request.request_id, 0, &[doc! { "ok": 1 }])
	} else {
		Vec::new()
	}
}

/// An address nothing is listening on.
pub fn dead_address() -> Address {
	let listener = TcpListener::bind("127.0.0.1:0").expect("failed to bind");
	let port = listener.local_addr().expect("no local address").port();
	drop(listener);
	Address { host: "127.0.0.1".to_string(), port }
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn connection_count_includes_just_opened_connections() {
		let server = FakeServer::ok();
		let _streams = (0..3)
			.map(|_| TcpStream::connect(("127.0.0.1", server.address.port)).unwrap())
			.collect::<Vec<_>>();

		assert_eq!(server.connection_count(), 3);
		assert_eq!(server.connection_count(), 3);
	}
}
