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
	crate::{*, topology::Connection, wire::InvalidReplyError},
	serde::{Serialize, de::DeserializeOwned},
	bson::Document
};

/// Lists the namespaces of a database on servers with the MMAPv1 catalog.
pub const NAMESPACES_COLLECTION: &str = "system.namespaces";
pub const INDEXES_COLLECTION:    &str = "system.indexes";

impl Connection {
	pub fn db(&mut self, name: &str) -> DataBase<'_> {
		let write_concern = self.options().write_concern;
		DataBase { conn: self, name: name.to_string(), write_concern }
	}

	/// The database named in the client options.
	pub fn default_db(&mut self) -> DataBase<'_> {
		let name = self.options().database.clone();
		self.db(&name)
	}
}

/// A database, bound to the connection it was opened on.
#[derive(Debug)]
pub struct DataBase<'a> {
	conn:              &'a mut Connection,
	pub name:          String,
	pub write_concern: WriteConcern
}

impl<'a> DataBase<'a> {
	pub fn collection(&mut self, name: &str) -> Collection<'_> {
		Collection::new(self.conn, &self.name, name, self.write_concern)
	}

	/// Consumes the database handle, binding the collection to the connection directly.
	pub fn into_collection(self, name: &str) -> Collection<'a> {
		Collection::new(self.conn, &self.name, name, self.write_concern)
	}

	/// The collection holding the index definitions of this database.
	pub fn indexes_collection(&mut self) -> Collection<'_> {
		self.collection(INDEXES_COLLECTION)
	}

	/// Names of the collections in this database. Index namespaces are skipped, system
	/// collections unless `include_system` is set.
	pub fn collection_names(&mut self, include_system: bool) -> Result<Vec<String>> {
		let mut names = Vec::new();
		let mut namespaces = self.collection(NAMESPACES_COLLECTION);
		for doc in namespaces.find(Document::new())? {
			let doc = doc?;
			let namespace = doc.get_str("name")
				.map_err(|_| InvalidReplyError::MissingField("name"))?;

			if namespace.contains('$') || (!include_system && namespace.contains(".system.")) {
				continue;
			}

			let name = namespace.splitn(2, '.').nth(1).unwrap_or(namespace);
			names.push(name.to_string());
		}
		Ok(names)
	}

	pub fn with_write_concern(mut self, write_concern: WriteConcern) -> Self {
		self.write_concern = write_concern;
		self
	}

	pub fn command(&mut self, command: &Document) -> Result<Document> {
		self.conn.command(&self.name, command)
	}

	pub fn run_command<R: DeserializeOwned>(&mut self, command: &impl Serialize) -> Result<R> {
		let command = bson::to_document(command)?;
		Ok(bson::from_document(self.command(&command)?)?)
	}

	/// see https://docs.mongodb.com/manual/reference/command/create/
	pub fn create_collection(&mut self, name: &str, options: Option<CreateCollectionOptions>) -> Result<()> {
		let options = options.unwrap_or_default();
		self.run_command::<Document>(&CreateCommand {
			create: name,
			capped: options.capped,
			size:   options.size,
			max:    options.max
		}).map(|_| ())
	}

	pub fn drop(&mut self) -> Result<()> {
		self.run_command::<Document>(&DropDatabaseCommand { drop_database: 1 }).map(|_| ())
	}
}

#[derive(Debug, Default, Copy, Clone, Eq, PartialEq)]
pub struct CreateCollectionOptions {
	pub capped: Option<bool>,
	/// Maximum size in bytes of a capped collection
	pub size:   Option<i64>,
	/// Maximum number of documents in a capped collection
	pub max:    Option<i64>
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateCommand<'a> {
	pub create: &'a str,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub capped: Option<bool>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub size:   Option<i64>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub max:    Option<i64>
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DropDatabaseCommand {
	pub drop_database: i32
}
