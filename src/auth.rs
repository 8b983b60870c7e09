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
	crate::{*, wire::{Channel, Stream, check_ok}},
	serde::{Serialize, Deserialize},
	bson::{doc, Bson},
	hmac::{Hmac, Mac},
	sha1::Sha1,
	sha2::{Sha256, Digest},
	base64::{Engine, engine::general_purpose::STANDARD as BASE64},
	rand::Rng,
	log::debug
};

pub const MIN_ITERATION_COUNT: u32 = 4096;

const CLIENT_NONCE_LEN: usize = 32;
const GS2_HEADER:       &str  = "n,,";
const CHANNEL_BINDING:  &str  = "c=biws";

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SaslStartCommand<'a> {
	sasl_start:     i32,
	mechanism:      AuthMech,
	#[serde(with = "serde_bytes")]
	payload:        &'a [u8],
	auto_authorize: i32
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SaslContinueCommand<'a> {
	sasl_continue:   i32,
	conversation_id: &'a Bson,
	#[serde(with = "serde_bytes")]
	payload:         &'a [u8]
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SaslResponse {
	conversation_id: Bson,
	#[serde(default)]
	done:            bool,
	#[serde(with = "serde_bytes")]
	payload:         Vec<u8>
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum AuthError {
	InvalidReply,
	InvalidServerNonce,
	InvalidServerSignature,
	InvalidIterationCount,
	MissingNonce,
	NotDone,
	KeyDerivation
}

/// Authenticates a freshly opened channel.
///
/// Unless the credential names a mechanism, SCRAM-SHA-256, SCRAM-SHA-1 and MONGODB-CR are tried
/// in that order until one succeeds. A rejected credential yields `Ok(false)`, errors are only
/// returned if the channel itself failed.
pub fn authenticate<S: Stream>(channel: &mut Channel<S>, credential: &Credential) -> Result<bool> {
	let username = credential.username.as_deref().unwrap_or_default();
	let password = credential.password.as_deref().unwrap_or_default();
	let source = credential.auth_source();
	let mechanisms = credential.mechanism
		.map_or_else(|| AuthMech::NEGOTIATION_ORDER.to_vec(), |mech| vec![mech]);

	for mechanism in mechanisms {
		let result = match mechanism {
			AuthMech::ScramSha256 => ScramVersion::Sha256
				.authenticate(channel, source, username, password, &generate_nonce()),
			AuthMech::ScramSha1   => ScramVersion::Sha1
				.authenticate(channel, source, username, password, &generate_nonce()),
			AuthMech::MongoDbCr   => auth_mongodb_cr(channel, source, username, password)
		};

		match result {
			Ok(()) => return Ok(true),
			Err(e) if e.is_fatal() => return Err(e),
			Err(e) => debug!("{:?} authentication of `{}` against `{}` failed: {}",
				mechanism, username, source, e)
		}
	}

	Ok(false)
}

fn auth_mongodb_cr<S: Stream>(
	channel:  &mut Channel<S>,
	source:   &str,
	username: &str,
	password: &str
) -> Result<()> {
	let reply = check_ok(channel.command(source, &doc! { "getnonce": 1 })?)?;
	let nonce = reply.get_str("nonce")
		.map_err(|_| Error::Auth(AuthError::MissingNonce))?;

	check_ok(channel.command(source, &doc! {
		"authenticate": 1,
		"user":         username,
		"nonce":        nonce,
		"key":          mongodb_cr_key(nonce, username, password)
	})?)?;
	Ok(())
}

fn mongodb_cr_key(nonce: &str, username: &str, password: &str) -> String {
	md5_hex(&format!("{}{}{}", nonce, username, password_digest(username, password)))
}

/// The legacy password digest, `md5("<user>:mongo:<password>")` as lowercase hex.
fn password_digest(username: &str, password: &str) -> String {
	md5_hex(&format!("{}:mongo:{}", username, password))
}

fn md5_hex(s: &str) -> String {
	format!("{:x}", md5::compute(s.as_bytes()))
}

fn generate_nonce() -> String {
	let mut rng = rand::thread_rng();
	(0..CLIENT_NONCE_LEN)
		.map(|_| rng.gen_range(0x2Du8..0x7Fu8) as char)
		.collect()
}

fn escape_username(username: &str) -> String {
	username.replace('=', "=3D").replace(',', "=2C")
}

/// Finds the value of `<key>=` in a comma separated SCRAM message.
fn parse_field(message: &str, key: char) -> Result<&str> {
	message.split(',')
		.find(|field| field.starts_with(key) && field[key.len_utf8()..].starts_with('='))
		.map(|field| &field[key.len_utf8() + 1..])
		.ok_or(Error::Auth(AuthError::InvalidReply))
}

#[derive(Debug, Clone, Eq, PartialEq)]
struct ServerFirst {
	nonce:      String,
	salt:       Vec<u8>,
	iterations: u32
}

impl ServerFirst {
	fn parse(message: &str) -> Result<Self> {
		Ok(Self {
			nonce:      parse_field(message, 'r')?.to_string(),
			salt:       BASE64.decode(parse_field(message, 's')?)
				.map_err(|_| Error::Auth(AuthError::InvalidReply))?,
			iterations: parse_field(message, 'i')?.parse()
				.map_err(|_| Error::Auth(AuthError::InvalidReply))?
		})
	}

	fn validate(&self, client_nonce: &str) -> Result<()> {
		if self.iterations < MIN_ITERATION_COUNT {
			Err(Error::Auth(AuthError::InvalidIterationCount))
		} else if !self.nonce.starts_with(client_nonce) {
			Err(Error::Auth(AuthError::InvalidServerNonce))
		} else {
			Ok(())
		}
	}
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
enum ScramVersion {
	Sha1,
	Sha256
}

impl ScramVersion {
	fn mechanism(self) -> AuthMech {
		match self {
			Self::Sha1   => AuthMech::ScramSha1,
			Self::Sha256 => AuthMech::ScramSha256
		}
	}

	fn h(self, data: &[u8]) -> Vec<u8> {
		match self {
			Self::Sha1   => Sha1::digest(data).to_vec(),
			Self::Sha256 => Sha256::digest(data).to_vec()
		}
	}

	fn hmac(self, key: &[u8], data: &[u8]) -> Result<Vec<u8>> {
		Ok(match self {
			Self::Sha1 => {
				let mut mac = Hmac::<Sha1>::new_from_slice(key)
					.map_err(|_| Error::Auth(AuthError::KeyDerivation))?;
				mac.update(data);
				mac.finalize().into_bytes().to_vec()
			}
			Self::Sha256 => {
				let mut mac = Hmac::<Sha256>::new_from_slice(key)
					.map_err(|_| Error::Auth(AuthError::KeyDerivation))?;
				mac.update(data);
				mac.finalize().into_bytes().to_vec()
			}
		})
	}

	fn h_i(self, password: &[u8], salt: &[u8], iterations: u32) -> Result<Vec<u8>> {
		let mut salted = match self {
			Self::Sha1   => vec![0u8; 20],
			Self::Sha256 => vec![0u8; 32]
		};

		match self {
			Self::Sha1   => pbkdf2::pbkdf2::<Hmac<Sha1>>(password, salt, iterations, &mut salted),
			Self::Sha256 => pbkdf2::pbkdf2::<Hmac<Sha256>>(password, salt, iterations, &mut salted)
		}.map_err(|_| Error::Auth(AuthError::KeyDerivation))?;

		Ok(salted)
	}

	fn salted_password(self, username: &str, password: &str, salt: &[u8], iterations: u32) -> Result<Vec<u8>> {
		match self {
			Self::Sha1   => self.h_i(password_digest(username, password).as_bytes(), salt, iterations),
			Self::Sha256 => self.h_i(password.as_bytes(), salt, iterations)
		}
	}

	/// Returns the client proof and the expected server signature.
	fn client_proof(self, salted_password: &[u8], auth_message: &str) -> Result<(Vec<u8>, Vec<u8>)> {
		let client_key = self.hmac(salted_password, b"Client Key")?;
		let server_key = self.hmac(salted_password, b"Server Key")?;
		let stored_key = self.h(&client_key);

		let client_signature = self.hmac(&stored_key, auth_message.as_bytes())?;
		let server_signature = self.hmac(&server_key, auth_message.as_bytes())?;

		let client_proof = client_key.iter()
			.zip(client_signature.iter())
			.map(|(k, s)| k ^ s)
			.collect();

		Ok((client_proof, server_signature))
	}

	fn authenticate<S: Stream>(
		self,
		channel:      &mut Channel<S>,
		source:       &str,
		username:     &str,
		password:     &str,
		client_nonce: &str
	) -> Result<()> {

		// client first message

		let client_first_bare = format!("n={},r={}", escape_username(username), client_nonce);
		let client_first = format!("{}{}", GS2_HEADER, client_first_bare);

		let start = sasl_response(channel.command(source, &bson::to_document(&SaslStartCommand {
			sasl_start:     1,
			mechanism:      self.mechanism(),
			payload:        client_first.as_bytes(),
			auto_authorize: 1
		})?)?)?;

		// server first message

		let server_first = std::str::from_utf8(&start.payload)
			.map_err(|_| Error::Auth(AuthError::InvalidReply))?;
		let server = ServerFirst::parse(server_first)?;
		server.validate(client_nonce)?;

		// client final message

		let salted_password = self.salted_password(username, password, &server.salt, server.iterations)?;
		let without_proof = format!("{},r={}", CHANNEL_BINDING, server.nonce);
		let auth_message = format!("{},{},{}", client_first_bare, server_first, without_proof);
		let (client_proof, server_signature) = self.client_proof(&salted_password, &auth_message)?;
		let client_final = format!("{},p={}", without_proof, BASE64.encode(&client_proof));

		let last = sasl_continue(channel, source, &start.conversation_id, client_final.as_bytes())?;

		// server final message

		let server_final = std::str::from_utf8(&last.payload)
			.map_err(|_| Error::Auth(AuthError::InvalidReply))?;
		let verifier = BASE64.decode(parse_field(server_final, 'v')?)
			.map_err(|_| Error::Auth(AuthError::InvalidReply))?;

		if verifier != server_signature {
			return Err(Error::Auth(AuthError::InvalidServerSignature));
		}

		// empty exchange, unless the server already finished the conversation

		if !last.done && !sasl_continue(channel, source, &start.conversation_id, &[])?.done {
			return Err(Error::Auth(AuthError::NotDone));
		}

		Ok(())
	}
}

fn sasl_continue<S: Stream>(
	channel:         &mut Channel<S>,
	source:          &str,
	conversation_id: &Bson,
	payload:         &[u8]
) -> Result<SaslResponse> {
	sasl_response(channel.command(source, &bson::to_document(&SaslContinueCommand {
		sasl_continue: 1,
		conversation_id,
		payload
	})?)?)
}

fn sasl_response(doc: bson::Document) -> Result<SaslResponse> {
	Ok(bson::from_document(check_ok(doc)?)?)
}
