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
	crate::{*, topology::Connection, wire::{Message, check_ok}},
	serde::Deserialize,
	bson::{doc, oid::ObjectId, Bson, Document}
};

/// A collection, bound to the connection it was opened on.
#[derive(Debug)]
pub struct Collection<'a> {
	conn:              &'a mut Connection,
	pub db:            String,
	pub name:          String,
	pub write_concern: WriteConcern
}

impl<'a> Collection<'a> {
	pub fn new(conn: &'a mut Connection, db: &str, name: &str, write_concern: WriteConcern) -> Self {
		Self { conn, db: db.to_string(), name: name.to_string(), write_concern }
	}

	pub fn namespace(&self) -> String {
		format!("{}.{}", self.db, self.name)
	}

	pub fn with_write_concern(mut self, write_concern: WriteConcern) -> Self {
		self.write_concern = write_concern;
		self
	}

	/// Opens a cursor over all documents matching `filter`. The query is sent on first access.
	pub fn find(&mut self, filter: Document) -> Result<Cursor<'_>> {
		let namespace = self.namespace();
		Ok(Cursor::new(self.conn.active()?, namespace, filter))
	}

	pub fn find_one(&mut self, filter: Document) -> Result<Option<Document>> {
		let namespace = self.namespace();
		self.conn.execute(|channel| Cursor::new(channel, namespace.as_str(), filter.clone())
			.limit(-1)
			.next()
			.transpose())
	}

	/// Counts the documents matching `filter` on the server.
	pub fn count(&mut self, filter: Document) -> Result<i64> {
		let namespace = self.namespace();
		self.conn.execute(|channel| Cursor::new(channel, namespace.as_str(), filter.clone())
			.count_matching())
	}

	/// Sends a write, retrying once on a fresh connection if it could not be delivered.
	/// Errors reported by the server are not retried.
	fn write(&mut self, message: &Message) -> Result<Option<LastError>> {
		let concern = self.write_concern;
		self.conn.execute(|channel| channel.write(message, &concern))?
			.map(LastError::from_reply)
			.transpose()
	}

	/// Inserts a document, generating an `_id` if it has none.
	pub fn insert_one(&mut self, document: Document) -> Result<InsertOneResult> {
		let mut result = self.insert_many(vec![document])?;
		Ok(InsertOneResult {
			acknowledged: result.acknowledged,
			inserted_id:  result.inserted_ids.remove(0)
		})
	}

	pub fn insert_many(&mut self, documents: impl IntoIterator<Item = Document>) -> Result<InsertManyResult> {
		let documents = documents.into_iter()
			.map(|mut doc| {
				if !doc.contains_key("_id") {
					let mut with_id = doc! { "_id": ObjectId::new() };
					for (key, value) in doc {
						with_id.insert(key, value);
					}
					doc = with_id;
				}
				doc
			})
			.collect::<Vec<_>>();
		let inserted_ids = documents.iter()
			.map(|doc| doc.get("_id").cloned().unwrap_or(Bson::Null))
			.collect();

		let namespace = self.namespace();
		let last_error = self.write(&Message::Insert {
			namespace:         &namespace,
			documents:         &documents,
			continue_on_error: false
		})?;

		Ok(InsertManyResult { acknowledged: last_error.is_some(), inserted_ids })
	}

	pub fn update(&mut self, selector: Document, update: Document, options: UpdateOptions) -> Result<UpdateResult> {
		let namespace = self.namespace();
		let last_error = self.write(&Message::Update {
			namespace: &namespace,
			selector:  &selector,
			update:    &update,
			upsert:    options.upsert,
			multi:     options.multi
		})?;

		Ok(match last_error {
			Some(last_error) => UpdateResult {
				acknowledged:     true,
				matched_count:    last_error.n as usize,
				updated_existing: last_error.updated_existing,
				upserted_id:      last_error.upserted
			},
			None => UpdateResult::default()
		})
	}

	/// Removes all documents matching `selector`, or only the first one if `single` is set.
	pub fn remove(&mut self, selector: Document, single: bool) -> Result<DeleteResult> {
		let namespace = self.namespace();
		let last_error = self.write(&Message::Delete {
			namespace: &namespace,
			selector:  &selector,
			single
		})?;

		Ok(DeleteResult {
			acknowledged:  last_error.is_some(),
			deleted_count: last_error.map_or(0, |e| e.n as usize)
		})
	}

	pub fn drop(&mut self) -> Result<()> {
		self.conn.command(&self.db, &doc! { "drop": self.name.as_str() }).map(|_| ())
	}
}

/// The reply to `getLastError`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LastError {
	#[serde(default)]
	n:                i64,
	err:              Option<String>,
	code:             Option<i32>,
	#[serde(default)]
	updated_existing: bool,
	upserted:         Option<Bson>
}

impl LastError {
	fn from_reply(reply: Document) -> Result<Self> {
		let last_error: Self = bson::from_document(check_ok(reply)?)?;
		match last_error.err {
			Some(err) => Err(Error::Operation(last_error.code, err)),
			None => Ok(last_error)
		}
	}
}

#[derive(Debug, Default, Copy, Clone, Eq, PartialEq)]
pub struct UpdateOptions {
	/// Inserts the update document if nothing matches the selector
	pub upsert: bool,
	/// Updates all matching documents instead of the first one
	pub multi:  bool
}

#[derive(Debug, Clone, PartialEq)]
pub struct InsertOneResult {
	/// Indicates whether this write result was acknowledged. If not, then all
	/// other members of this result will be undefined.
	pub acknowledged: bool,
	pub inserted_id:  Bson
}

#[derive(Debug, Clone, PartialEq)]
pub struct InsertManyResult {
	/// Indicates whether this write result was acknowledged. If not, then all
	/// other members of this result will be undefined.
	pub acknowledged: bool,
	/// The `_id` of each document, in insertion order.
	pub inserted_ids: Vec<Bson>
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct UpdateResult {
	/// Indicates whether this write result was acknowledged. If not, then all
	/// other members of this result will be undefined.
	pub acknowledged:     bool,
	/// The number of documents that matched the selector, or 1 after an upsert.
	pub matched_count:    usize,
	pub updated_existing: bool,
	/// The identifier of the inserted document if an upsert took place.
	pub upserted_id:      Option<Bson>
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct DeleteResult {
	/// Indicates whether this write result was acknowledged. If not, then all
	/// other members of this result will be undefined.
	pub acknowledged:  bool,
	/// The number of documents that were deleted.
	pub deleted_count: usize
}
