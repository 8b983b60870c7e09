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
	crate::{*, wire::{Channel, Stream, Reply, InvalidReplyError, check_ok}},
	std::{net::TcpStream, time::Duration},
	bson::{doc, Bson, Document}
};

#[derive(Debug)]
pub enum CursorError {
	/// The server does not know the cursor with this id (anymore)
	NotFound(i64),
	/// The server rejected the query
	QueryFailure { code: Option<i32>, message: String },
	/// The namespace is not of the form `<db>.<collection>`
	InvalidNamespace(String)
}

/// Number of documents requested by the initial query.
///
/// Negative values pass through, they tell the server to return a single batch and close
/// the cursor. A limit of 0 means no limit, a batch size of 0 leaves the batch size to the
/// server.
pub fn initial_request_size(limit: i32, batch_size: i32) -> i32 {
	if limit < 0 {
		limit
	} else if batch_size < 0 {
		batch_size
	} else if limit == 0 || batch_size == 0 {
		limit.max(batch_size)
	} else {
		limit.min(batch_size)
	}
}

/// Splits `<db>.<collection>` into its two parts.
fn split_namespace(namespace: &str) -> Result<(&str, &str)> {
	match namespace.find('.') {
		Some(dot) if dot > 0 && dot + 1 < namespace.len() => Ok((&namespace[..dot], &namespace[dot + 1..])),
		_ => Err(CursorError::InvalidNamespace(namespace.to_string()).into())
	}
}

#[derive(Debug, Clone, PartialEq)]
pub struct CursorInfo {
	pub namespace:  String,
	pub query:      Document,
	pub fields:     Option<Document>,
	pub limit:      i32,
	pub batch_size: i32,
	pub skip:       i32,
	pub timeout:    Option<Duration>,
	pub started:    bool,
	pub cursor_id:  i64
}

/// A lazily executed query.
///
/// The query is sent on first access, further batches are fetched on demand from the
/// connection the cursor was opened on. Fetched documents stay buffered, so `rewind`
/// replays them without another round trip.
///
/// The position is the index of the current document, starting at 0.
#[derive(Debug)]
pub struct Cursor<'a, S: Stream = TcpStream> {
	channel:    &'a mut Channel<S>,
	namespace:  String,
	query:      Document,
	modifiers:  Document,
	fields:     Option<Document>,
	skip:       i32,
	limit:      i32,
	batch_size: i32,
	timeout:    Option<Duration>,
	cursor_id:  i64,
	documents:  Vec<Document>,
	position:   usize,
	started:    bool,
	end:        bool,
	failed:     bool
}

impl<'a, S: Stream> Cursor<'a, S> {
	pub fn new(channel: &'a mut Channel<S>, namespace: impl Into<String>, query: Document) -> Self {
		Self {
			channel,
			namespace:  namespace.into(),
			query,
			modifiers:  Document::new(),
			fields:     None,
			skip:       0,
			limit:      0,
			batch_size: DEFAULT_BATCH_SIZE,
			timeout:    None,
			cursor_id:  0,
			documents:  Vec::new(),
			position:   0,
			started:    false,
			end:        false,
			failed:     false
		}
	}

	pub fn limit(mut self, limit: i32) -> Self {
		self.limit = limit;
		self
	}

	pub fn skip(mut self, skip: i32) -> Self {
		self.skip = skip;
		self
	}

	pub fn batch_size(mut self, batch_size: i32) -> Self {
		self.batch_size = batch_size;
		self
	}

	/// Read timeout for the replies to this query, instead of the connection's socket timeout.
	pub fn timeout(mut self, timeout: Duration) -> Self {
		self.timeout = Some(timeout).filter(|t| *t != Duration::from_secs(0));
		self
	}

	pub fn fields(mut self, fields: Document) -> Self {
		self.fields = Some(fields);
		self
	}

	pub fn sort(mut self, sort: Document) -> Self {
		self.modifiers.insert("$orderby", sort);
		self
	}

	/// Index name or key pattern of the index to use.
	pub fn hint(mut self, index: impl Into<Bson>) -> Self {
		self.modifiers.insert("$hint", index.into());
		self
	}

	pub fn snapshot(mut self) -> Self {
		self.modifiers.insert("$snapshot", true);
		self
	}

	pub fn namespace(&self) -> &str {
		&self.namespace
	}

	pub fn info(&self) -> CursorInfo {
		CursorInfo {
			namespace:  self.namespace.clone(),
			query:      self.query.clone(),
			fields:     self.fields.clone(),
			limit:      self.limit,
			batch_size: self.batch_size,
			skip:       self.skip,
			timeout:    self.timeout,
			started:    self.started,
			cursor_id:  self.cursor_id
		}
	}

	/// The query as sent, wrapped in `$query` if modifiers are present.
	fn wire_query(&self) -> Document {
		if self.modifiers.is_empty() {
			return self.query.clone();
		}

		let mut query = doc! { "$query": self.query.clone() };
		for (key, value) in &self.modifiers {
			query.insert(key.clone(), value.clone());
		}
		query
	}

	fn document(&self, position: usize) -> Option<&Document> {
		self.documents.get(position)
	}

	fn apply(&mut self, result: Result<Reply>) -> Result<()> {
		match result {
			Ok(reply) => {
				if reply.documents.is_empty() {
					self.end = true;
				}
				self.cursor_id = reply.cursor_id;
				self.documents.extend(reply.documents);
				Ok(())
			}
			Err(e) => {
				self.end = true;
				self.failed = true;
				Err(e)
			}
		}
	}

	fn do_query(&mut self) -> Result<()> {
		if self.started {
			return Ok(());
		}

		self.started = true;
		let query = self.wire_query();
		let (namespace, fields) = (&self.namespace, self.fields.as_ref());
		let (skip, limit) = (self.skip, initial_request_size(self.limit, self.batch_size));
		let result = self.channel.with_read_timeout(self.timeout,
			|channel| channel.query(namespace, &query, fields, skip, limit));
		self.apply(result)
	}

	/// Size of the next get-more request. Marks the cursor exhausted once the limit is reached.
	fn next_request_size(&mut self) -> i32 {
		let buffered = self.documents.len() as i32;
		if self.limit > 0 && buffered >= self.limit {
			self.end = true;
			return 0;
		}

		match self.limit {
			limit if limit > 0 && (self.batch_size <= 0 || limit - buffered < self.batch_size) =>
				limit - buffered,
			_ => self.batch_size
		}
	}

	fn fetch_more(&mut self) -> Result<()> {
		let limit = self.next_request_size();
		if self.end {
			return Ok(());
		}

		let (namespace, cursor_id) = (&self.namespace, self.cursor_id);
		let result = self.channel.with_read_timeout(self.timeout,
			|channel| channel.get_more(namespace, limit, cursor_id));
		self.apply(result)
	}

	/// Fetches the next batch if the document at `position` is not buffered yet.
	fn fetch_for(&mut self, position: usize) -> Result<()> {
		if self.document(position).is_some() {
			Ok(())
		} else if self.cursor_id != 0 && !self.end {
			self.fetch_more()
		} else {
			self.end = true;
			Ok(())
		}
	}

	/// Returns false once the cursor is exhausted.
	pub fn valid(&mut self) -> Result<bool> {
		self.do_query()?;
		Ok(!self.end)
	}

	/// The document at the current position.
	pub fn current(&mut self) -> Result<Option<&Document>> {
		self.do_query()?;
		self.fetch_for(self.position)?;
		Ok(self.document(self.position))
	}

	/// The `_id` of the current document as string, or the position if it has none.
	pub fn key(&mut self) -> Result<Option<String>> {
		let position = self.position;
		Ok(self.current()?.map(|doc| match doc.get("_id") {
			Some(Bson::ObjectId(id)) => id.to_hex(),
			Some(Bson::String(id))   => id.clone(),
			Some(id)                 => id.to_string(),
			None                     => position.to_string()
		}))
	}

	/// Moves to the next position, fetching the next batch if it is not buffered.
	pub fn advance(&mut self) -> Result<()> {
		self.do_query()?;
		self.fetch_for(self.position + 1)?;
		self.position += 1;
		Ok(())
	}

	/// Whether `get_next` returns a document.
	pub fn has_next(&mut self) -> Result<bool> {
		self.do_query()?;
		self.fetch_for(self.position)?;
		Ok(self.document(self.position).is_some())
	}

	/// Returns the current document and moves past it.
	pub fn get_next(&mut self) -> Result<Option<Document>> {
		self.do_query()?;
		self.fetch_for(self.position)?;

		let doc = self.document(self.position).cloned();
		match doc {
			Some(_) => self.position += 1,
			None    => self.end = true
		}
		Ok(doc)
	}

	/// Moves back to the first document and clears the end flag. Buffered documents are kept.
	pub fn rewind(&mut self) {
		self.position = 0;
		self.end = false;
	}

	/// Discards all state, the query is sent again on next access.
	pub fn reset(&mut self) {
		self.documents.clear();
		self.position = 0;
		self.cursor_id = 0;
		self.started = false;
		self.end = false;
		self.failed = false;
	}

	/// Counts the documents matching the query on the server, ignoring limit and skip.
	pub fn count_matching(&mut self) -> Result<i64> {
		let (db, collection) = split_namespace(&self.namespace)?;
		let command = doc! { "count": collection, "query": self.query.clone() };
		let reply = check_ok(self.channel.with_read_timeout(self.timeout,
			|channel| channel.command(db, &command))?)?;

		match reply.get("n") {
			Some(Bson::Int32(n))  => Ok(i64::from(*n)),
			Some(Bson::Int64(n))  => Ok(*n),
			Some(Bson::Double(n)) => Ok(*n as i64),
			_ => Err(InvalidReplyError::MissingField("n").into())
		}
	}

	/// Counts the documents this cursor yields, iterating from the first one.
	pub fn count_local(&mut self) -> Result<usize> {
		self.do_query()?;
		self.rewind();
		let mut count = 0;
		while self.get_next()?.is_some() {
			count += 1;
		}
		Ok(count)
	}

	/// Returns the query plan instead of the results.
	pub fn explain(&mut self) -> Result<Document> {
		let mut query = self.wire_query();
		if !query.contains_key("$query") {
			query = doc! { "$query": query };
		}
		query.insert("$explain", true);

		let (namespace, fields) = (&self.namespace, self.fields.as_ref());
		let (skip, limit) = (self.skip, initial_request_size(self.limit, self.batch_size));
		self.channel.with_read_timeout(self.timeout,
			|channel| channel.query(namespace, &query, fields, skip, limit))?.into_first()
	}

	/// Closes the server side cursor, if any.
	pub fn kill(&mut self) -> Result<()> {
		if self.cursor_id != 0 {
			self.channel.kill_cursors(&[self.cursor_id])?;
			self.cursor_id = 0;
		}
		self.end = true;
		Ok(())
	}
}

impl<S: Stream> Iterator for Cursor<'_, S> {
	type Item = Result<Document>;

	fn next(&mut self) -> Option<Self::Item> {
		if self.failed {
			return None;
		}
		self.get_next().transpose()
	}
}

#[cfg(test)]
mod tests {
	use {super::*, crate::{testing::*, wire::OpCode}};

	fn docs(range: std::ops::Range<i32>) -> Vec<Document> {
		range.map(|i| doc! { "_id": i }).collect()
	}

	fn channel(replies: Vec<Vec<u8>>) -> Channel<MockStream> {
		Channel::new(MockStream::new(replies))
	}

	#[test]
	fn initial_request_size_bounds() {
		for limit in 1..50 {
			for batch_size in 1..50 {
				let size = initial_request_size(limit, batch_size);
				assert!(size <= batch_size && size <= limit, "{} {} {}", limit, batch_size, size);
			}
		}

		for limit in -10..0 {
			for batch_size in -10..10 {
				assert_eq!(initial_request_size(limit, batch_size), limit);
			}
		}

		assert_eq!(initial_request_size(0, 2), 2);
		assert_eq!(initial_request_size(0, -4), -4);
		assert_eq!(initial_request_size(7, 0), 7);
		assert_eq!(initial_request_size(0, 0), 0);
	}

	#[test]
	fn limit_spanning_several_batches() {
		let mut channel = channel(vec![
			reply(3, 42, &docs(0..2)),
			reply(4, 42, &docs(2..4)),
			reply(5, 42, &docs(4..5))
		]);

		let mut cursor = Cursor::new(&mut channel, "db.coll", doc! {})
			.limit(5)
			.batch_size(2);
		let results = cursor.by_ref().collect::<Result<Vec<_>>>().unwrap();
		assert_eq!(results, docs(0..5));

		// the limit is reached, the next size is 0 and nothing is sent
		assert!(!cursor.valid().unwrap());
		assert_eq!(cursor.next_request_size(), 0);
		drop(cursor);

		let requests = channel.get_ref().requests();
		assert_eq!(requests.iter().map(|r| r.limit).collect::<Vec<_>>(), vec![2, 2, 1]);
		assert!(requests[0].is_op(OpCode::Query));
		assert!(requests[1..].iter().all(|r| r.is_op(OpCode::GetMore) && r.cursor_id == 42));
	}

	#[test]
	fn empty_batch_exhausts_cursor() {
		let mut channel = channel(vec![reply(3, 0, &[])]);
		let mut cursor = Cursor::new(&mut channel, "db.coll", doc! { "x": 1 });

		assert!(!cursor.valid().unwrap());
		assert!(cursor.next().is_none());
		assert_eq!(cursor.current().unwrap(), None);
	}

	#[test]
	fn empty_get_more_exhausts_cursor() {
		let mut channel = channel(vec![
			reply(3, 9, &docs(0..1)),
			reply(4, 9, &[])
		]);
		let mut cursor = Cursor::new(&mut channel, "db.coll", doc! {});

		assert_eq!(cursor.by_ref().count(), 1);
		assert!(!cursor.valid().unwrap());
	}

	#[test]
	fn buffered_documents_are_not_fetched_again() {
		let mut channel = channel(vec![reply(3, 7, &docs(0..3))]);
		let mut cursor = Cursor::new(&mut channel, "db.coll", doc! {});

		assert!(cursor.has_next().unwrap());
		assert_eq!(cursor.get_next().unwrap(), Some(doc! { "_id": 0 }));
		assert!(cursor.has_next().unwrap());
		assert_eq!(cursor.get_next().unwrap(), Some(doc! { "_id": 1 }));
		assert_eq!(cursor.key().unwrap().as_deref(), Some("2"));
		drop(cursor);

		assert_eq!(channel.get_ref().requests().len(), 1);
	}

	#[test]
	fn unlimited_cursor_fetches_batch_size() {
		let mut channel = channel(vec![
			reply(3, 5, &docs(0..2)),
			reply(4, 0, &docs(2..3))
		]);
		let cursor = Cursor::new(&mut channel, "db.coll", doc! {}).batch_size(2);

		assert_eq!(cursor.map(Result::unwrap).collect::<Vec<_>>(), docs(0..3));

		let requests = channel.get_ref().requests();
		assert_eq!(requests.iter().map(|r| r.limit).collect::<Vec<_>>(), vec![2, 2]);
	}

	#[test]
	fn negative_limit_returns_single_batch() {
		let mut channel = channel(vec![reply(3, 0, &docs(0..3))]);
		let cursor = Cursor::new(&mut channel, "db.coll", doc! {}).limit(-3);

		assert_eq!(cursor.count(), 3);
		assert_eq!(channel.get_ref().requests()[0].limit, -3);
	}

	#[test]
	fn key_without_id_is_position() {
		let mut channel = channel(vec![reply(3, 0, &[doc! { "a": 1 }, doc! { "a": 2 }])]);
		let mut cursor = Cursor::new(&mut channel, "db.coll", doc! {});

		assert_eq!(cursor.key().unwrap().as_deref(), Some("0"));
		cursor.advance().unwrap();
		assert_eq!(cursor.key().unwrap().as_deref(), Some("1"));
		cursor.advance().unwrap();
		assert_eq!(cursor.key().unwrap(), None);
	}

	#[test]
	fn fresh_cursor_is_at_first_document() {
		let mut channel = channel(vec![reply(3, 0, &docs(0..3))]);
		let mut cursor = Cursor::new(&mut channel, "db.coll", doc! {});

		assert!(cursor.valid().unwrap());
		assert_eq!(cursor.current().unwrap(), Some(&doc! { "_id": 0 }));
		assert_eq!(cursor.key().unwrap().as_deref(), Some("0"));
	}

	#[test]
	fn valid_current_advance_loop() {
		let mut channel = channel(vec![
			reply(3, 8, &docs(0..2)),
			reply(4, 0, &docs(2..3))
		]);
		let mut cursor = Cursor::new(&mut channel, "db.coll", doc! {}).batch_size(2);

		let mut seen = Vec::new();
		while cursor.valid().unwrap() {
			seen.push(cursor.current().unwrap().cloned());
			cursor.advance().unwrap();
		}
		assert_eq!(seen, docs(0..3).into_iter().map(Some).collect::<Vec<_>>());
	}

	#[test]
	fn get_next_after_rewind_starts_over() {
		let mut channel = channel(vec![reply(3, 0, &docs(0..3)), reply(4, 0, &[])]);
		let mut cursor = Cursor::new(&mut channel, "db.coll", doc! {});

		assert_eq!(cursor.get_next().unwrap(), Some(doc! { "_id": 0 }));
		assert_eq!(cursor.get_next().unwrap(), Some(doc! { "_id": 1 }));
		cursor.rewind();
		assert_eq!(cursor.get_next().unwrap(), Some(doc! { "_id": 0 }));

		cursor.reset();
		assert_eq!(cursor.key().unwrap(), None);
	}

	#[test]
	fn rewind_replays_buffer() {
		let mut channel = channel(vec![reply(3, 0, &docs(0..2))]);
		let mut cursor = Cursor::new(&mut channel, "db.coll", doc! {});

		assert_eq!(cursor.by_ref().count(), 2);
		cursor.rewind();
		assert_eq!(cursor.by_ref().map(Result::unwrap).collect::<Vec<_>>(), docs(0..2));
		assert_eq!(cursor.count_local().unwrap(), 2);
		drop(cursor);

		assert_eq!(channel.get_ref().requests().len(), 1);
	}

	#[test]
	fn reset_runs_query_again() {
		let mut channel = channel(vec![
			reply(3, 0, &docs(0..1)),
			reply(4, 0, &docs(0..1))
		]);
		let mut cursor = Cursor::new(&mut channel, "db.coll", doc! {});

		assert_eq!(cursor.by_ref().count(), 1);
		cursor.reset();
		assert!(!cursor.info().started);
		assert_eq!(cursor.by_ref().count(), 1);
		drop(cursor);

		assert_eq!(channel.get_ref().requests().len(), 2);
	}

	#[test]
	fn count_runs_count_command() {
		let mut channel = channel(vec![reply(3, 0, &[doc! { "n": 12.0, "ok": 1.0 }])]);
		let mut cursor = Cursor::new(&mut channel, "shop.orders", doc! { "paid": true });

		assert_eq!(cursor.count_matching().unwrap(), 12);
		drop(cursor);

		let requests = channel.get_ref().requests();
		assert_eq!(requests[0].namespace, "shop.$cmd");
		assert_eq!(requests[0].limit, -1);
		assert_eq!(requests[0].documents[0], doc! { "count": "orders", "query": { "paid": true } });
	}

	#[test]
	fn count_rejects_namespace_without_collection() {
		for namespace in &["orders", "shop.", ".orders"] {
			let mut channel = channel(vec![]);
			let mut cursor = Cursor::new(&mut channel, *namespace, doc! {});

			assert!(matches!(cursor.count_matching(),
				Err(Error::Cursor(CursorError::InvalidNamespace(ref ns))) if ns == namespace));
			drop(cursor);
			assert!(channel.get_ref().requests().is_empty());
		}
	}

	#[test]
	fn timeout_applies_to_every_fetch() {
		let mut channel = channel(vec![
			reply(3, 6, &docs(0..1)),
			reply(4, 0, &docs(1..2))
		]);
		let timeout = Duration::from_millis(500);
		let cursor = Cursor::new(&mut channel, "db.coll", doc! {})
			.batch_size(1)
			.timeout(timeout);

		assert_eq!(cursor.info().timeout, Some(timeout));
		assert_eq!(cursor.count(), 2);
		assert_eq!(channel.get_ref().read_timeouts, vec![Some(timeout), None, Some(timeout), None]);
	}

	#[test]
	fn modifiers_wrap_query() {
		let mut channel = channel(vec![reply(3, 0, &[])]);
		let mut cursor = Cursor::new(&mut channel, "db.coll", doc! { "a": 1 })
			.sort(doc! { "b": -1 })
			.hint("b_-1")
			.fields(doc! { "a": 1 })
			.skip(4);

		assert!(!cursor.valid().unwrap());
		assert!(cursor.info().started);
		drop(cursor);

		let request = &channel.get_ref().requests()[0];
		assert_eq!(request.skip, 4);
		assert_eq!(request.documents, vec![
			doc! { "$query": { "a": 1 }, "$orderby": { "b": -1 }, "$hint": "b_-1" },
			doc! { "a": 1 }
		]);
	}

	#[test]
	fn explain_wraps_query() {
		let mut channel = channel(vec![reply(3, 0, &[doc! { "cursor": "BasicCursor" }])]);
		let mut cursor = Cursor::new(&mut channel, "db.coll", doc! { "a": 1 });

		assert_eq!(cursor.explain().unwrap(), doc! { "cursor": "BasicCursor" });
		drop(cursor);

		assert_eq!(channel.get_ref().requests()[0].documents[0],
			doc! { "$query": { "a": 1 }, "$explain": true });
	}

	#[test]
	fn cursor_not_found_ends_iteration() {
		let mut channel = channel(vec![
			reply(3, 11, &docs(0..1)),
			reply_with_flags(4, 1, 11, &[])
		]);
		let mut cursor = Cursor::new(&mut channel, "db.coll", doc! {});

		assert_eq!(cursor.next().unwrap().unwrap(), doc! { "_id": 0 });
		assert!(matches!(cursor.next(), Some(Err(Error::Cursor(CursorError::NotFound(11))))));
		assert!(cursor.next().is_none());
	}

	#[test]
	fn kill_closes_server_cursor() {
		let mut channel = channel(vec![reply(3, 99, &docs(0..2))]);
		let mut cursor = Cursor::new(&mut channel, "db.coll", doc! {});

		assert!(cursor.valid().unwrap());
		cursor.kill().unwrap();
		assert!(!cursor.valid().unwrap());
		assert_eq!(cursor.info().cursor_id, 0);
		drop(cursor);

		let requests = channel.get_ref().requests();
		assert!(requests[1].is_op(OpCode::KillCursors));
		assert_eq!(requests[1].cursor_id, 99);
	}
}
