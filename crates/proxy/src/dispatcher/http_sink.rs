use async_trait::async_trait;
use bytes::Bytes;
use http_body_util::Full;
use hyper::Request;
use hyper_util::client::legacy::Client;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::rt::TokioExecutor;

use crate::events::Event;

use super::Sink;

type HttpClient = Client<hyper_rustls::HttpsConnector<HttpConnector>, Full<Bytes>>;

/// Posts events to an external HTTP endpoint, reusing the same upstream
/// client stack as the proxy pipeline (`hyper-util` + `hyper-rustls`).
pub struct HttpSink {
	url: String,
	client: HttpClient,
}

impl HttpSink {
	pub fn new(url: impl Into<String>) -> Self {
		let https = hyper_rustls::HttpsConnectorBuilder::new()
			.with_native_roots()
			.expect("native root certificates must be available")
			.https_or_http()
			.enable_http1()
			.build();
		Self {
			url: url.into(),
			client: Client::builder(TokioExecutor::new()).build(https),
		}
	}
}

#[async_trait]
impl Sink for HttpSink {
	async fn send(&self, event: &Event) -> anyhow::Result<()> {
		let body = serde_json::to_vec(event)?;
		let req = Request::post(&self.url)
			.header(http::header::CONTENT_TYPE, "application/json")
			.body(Full::new(Bytes::from(body)))?;
		let resp = self.client.request(req).await?;
		if !resp.status().is_success() {
			anyhow::bail!("sink returned {}", resp.status());
		}
		Ok(())
	}

	fn name(&self) -> &str {
		&self.url
	}
}
