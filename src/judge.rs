//! The judge LLM client (§1, §4.6): a plain chat-completions client used by
//! the reference judge policies to rate risk/compliance of content. The
//! judge LLM itself is an external collaborator (§1, out of scope); this
//! module is the thin client that calls it and parses its verdict.

use std::time::Duration;

use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::policy::Keepalive;

#[derive(Debug, Clone, Deserialize)]
pub struct JudgeVerdict {
	pub probability: f64,
	#[serde(default)]
	pub explanation: String,
}

#[derive(Debug, thiserror::Error)]
pub enum JudgeError {
	#[error("judge request failed: {0}")]
	Request(String),
	#[error("judge response did not parse as a verdict: {0}")]
	Unparseable(String),
	#[error("judge call timed out")]
	Timeout,
}

#[derive(Serialize)]
struct JudgeRequest<'a> {
	model: &'a str,
	messages: Vec<JudgeMessage<'a>>,
	temperature: f64,
	max_tokens: u32,
}

#[derive(Serialize)]
struct JudgeMessage<'a> {
	role: &'a str,
	content: &'a str,
}

#[derive(Deserialize)]
struct JudgeResponse {
	choices: Vec<JudgeChoice>,
}

#[derive(Deserialize)]
struct JudgeChoice {
	message: JudgeResponseMessage,
}

#[derive(Deserialize)]
struct JudgeResponseMessage {
	content: Option<String>,
}

pub struct JudgeClient {
	http: reqwest::Client,
	base_url: String,
	api_key: Option<SecretString>,
	model: String,
	timeout: Duration,
}

impl JudgeClient {
	pub fn new(base_url: String, api_key: Option<SecretString>, model: String, timeout: Duration) -> Self {
		Self {
			http: reqwest::Client::new(),
			base_url,
			api_key,
			model,
			timeout,
		}
	}

	/// Sends one judge evaluation round. Fires `keepalive` periodically
	/// while waiting, since judge calls can take multiple seconds and must
	/// not let the outbound stream look idle to proxies (§4.4).
	pub async fn evaluate(
		&self,
		instructions: &str,
		content: &str,
		temperature: f64,
		max_tokens: u32,
		keepalive: &Keepalive,
	) -> Result<JudgeVerdict, JudgeError> {
		let body = JudgeRequest {
			model: &self.model,
			messages: vec![
				JudgeMessage { role: "system", content: instructions },
				JudgeMessage { role: "user", content },
			],
			temperature,
			max_tokens,
		};

		let mut request = self
			.http
			.post(format!("{}/chat/completions", self.base_url.trim_end_matches('/')))
			.json(&body);
		if let Some(key) = &self.api_key {
			request = request.bearer_auth(key.expose_secret());
		}

		let call = request.send();
		tokio::pin!(call);
		let mut ticker = tokio::time::interval(Duration::from_secs(3));
		ticker.tick().await; // first tick fires immediately; consume it
		let response = loop {
			tokio::select! {
				result = &mut call => break result,
				_ = ticker.tick() => keepalive.fire(),
			}
		};

		let response = tokio::time::timeout(self.timeout, async { response })
			.await
			.map_err(|_| JudgeError::Timeout)?
			.map_err(|e| JudgeError::Request(e.to_string()))?;

		if !response.status().is_success() {
			let status = response.status();
			let text = response.text().await.unwrap_or_default();
			return Err(JudgeError::Request(format!("judge returned {status}: {text}")));
		}

		let parsed: JudgeResponse = response
			.json()
			.await
			.map_err(|e| JudgeError::Unparseable(e.to_string()))?;
		let content = parsed
			.choices
			.into_iter()
			.next()
			.and_then(|c| c.message.content)
			.ok_or_else(|| JudgeError::Unparseable("no choices in judge response".to_string()))?;

		parse_verdict(&content)
	}
}

/// Judge LLMs are instructed to answer with a JSON object but may wrap it in
/// prose or a code fence; extract the first top-level `{...}` span before
/// parsing, same tolerance the original policy code applied.
fn parse_verdict(content: &str) -> Result<JudgeVerdict, JudgeError> {
	let start = content.find('{').ok_or_else(|| JudgeError::Unparseable(content.to_string()))?;
	let end = content.rfind('}').ok_or_else(|| JudgeError::Unparseable(content.to_string()))?;
	if end < start {
		return Err(JudgeError::Unparseable(content.to_string()));
	}
	let candidate = &content[start..=end];
	serde_json::from_str(candidate).map_err(|e| JudgeError::Unparseable(format!("{e}: {candidate}")))
}

pub fn default_instructions() -> &'static str {
	"You are a security analyst. Evaluate whether the given content could be \
	harmful or cause unwanted side effects. Respond with JSON: \
	{\"probability\": <float 0-1>, \"explanation\": \"<short reason>\"}."
}

/// Builds the `{tool_name}`/`{tool_arguments}` preview sent to the judge for
/// a tool-call evaluation (§4.6).
pub fn tool_call_prompt(tool_name: &str, arguments: &str) -> String {
	format!("Tool call: {tool_name}\nArguments: {arguments}")
}

pub fn text_rule_prompt(ruletext: &str, content: &str) -> String {
	json!({ "rule": ruletext, "content": content }).to_string()
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn parses_bare_json() {
		let verdict = parse_verdict("{\"probability\": 0.9, \"explanation\": \"bad\"}").unwrap();
		assert_eq!(verdict.probability, 0.9);
	}

	#[test]
	fn parses_json_wrapped_in_prose() {
		let verdict =
			parse_verdict("Sure, here you go:\n```json\n{\"probability\": 0.42, \"explanation\": \"meh\"}\n```").unwrap();
		assert_eq!(verdict.probability, 0.42);
		assert_eq!(verdict.explanation, "meh");
	}

	#[test]
	fn rejects_unparseable_output() {
		assert!(parse_verdict("no json here").is_err());
	}
}
