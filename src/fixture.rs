use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;

use crate::error::FixtureError;
use crate::proxy::{RegistrarPolicy, SipProxy};
use crate::settings::FixtureConfig;
use crate::sip::Request;

/// Parameter value as it travels over the bus: strings and unsigned 32-bit ints
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParamValue {
    UInt32(u32),
    String(String),
}

impl From<&str> for ParamValue {
    fn from(value: &str) -> Self {
        ParamValue::String(value.to_string())
    }
}

impl From<u32> for ParamValue {
    fn from(value: u32) -> Self {
        ParamValue::UInt32(value)
    }
}

pub type TestParams = BTreeMap<String, ParamValue>;

/// Account parameters handed to the harness for a config
pub fn test_params(config: &FixtureConfig) -> TestParams {
    let mut params = TestParams::new();
    params.insert("account".to_string(), config.account.as_str().into());
    params.insert("password".to_string(), config.password.as_str().into());
    params.insert("port".to_string(), u32::from(config.port).into());
    params
}

/// Objects a test scenario hangs on to while it runs
#[derive(Default)]
pub struct TestData {
    pub sip: Option<Arc<SipProxy>>,
    server: Option<JoinHandle<()>>,
}

impl Drop for TestData {
    fn drop(&mut self) {
        if let Some(server) = self.server.take() {
            server.abort();
        }
    }
}

pub struct TestContext {
    pub name: String,
    pub protocol: String,
    pub params: TestParams,
    pub data: TestData,
}

impl TestContext {
    pub fn new(name: &str, protocol: &str, params: TestParams) -> Self {
        Self {
            name: name.to_string(),
            protocol: protocol.to_string(),
            params,
            data: TestData::default(),
        }
    }

    pub fn sip(&self) -> Option<&Arc<SipProxy>> {
        self.data.sip.as_ref()
    }
}

/// The test runner that owns the service under test. `go` builds the
/// registrar side of a scenario and then hands control to `run_test`; the
/// registrar stops when the context is dropped.
#[async_trait]
pub trait Harness: Send + Sync {
    async fn create_test(
        &self,
        name: &str,
        protocol: &str,
        params: TestParams,
    ) -> Result<TestContext, FixtureError>;

    async fn run_test(&self, test: TestContext) -> Result<(), FixtureError>;
}

/// Set up the default scenario: account `sip:testacc@127.0.0.1`, password
/// `testpwd`, registrar on UDP 9090, registrations gated by `register_cb`.
pub async fn go<H, F>(harness: &H, register_cb: F) -> Result<(), FixtureError>
where
    H: Harness + ?Sized,
    F: Fn(&Request, &str, u16) -> bool + Send + Sync + 'static,
{
    go_with(
        harness,
        &FixtureConfig::default(),
        RegistrarPolicy::from_fn(register_cb),
    )
    .await
}

pub async fn go_with<H>(
    harness: &H,
    config: &FixtureConfig,
    policy: RegistrarPolicy,
) -> Result<(), FixtureError>
where
    H: Harness + ?Sized,
{
    let params = test_params(config);
    let mut test = harness
        .create_test(&config.test_name, &config.protocol, params)
        .await?;

    let proxy = SipProxy::bind(
        (config.bind_host.as_str(), config.port),
        &config.registrar_domain,
        config.default_expiry(),
        policy,
    )
    .await
    .map_err(|source| FixtureError::Bind {
        port: config.port,
        source,
    })?;
    let proxy = Arc::new(proxy);

    test.data.server = Some(proxy.spawn());
    test.data.sip = Some(proxy);

    tracing::info!("[Fixture] Running test {} ({})", test.name, test.protocol);
    harness.run_test(test).await
}

/// Harness for running the registrar on its own: waits for Ctrl-C
pub struct StandaloneHarness;

#[async_trait]
impl Harness for StandaloneHarness {
    async fn create_test(
        &self,
        name: &str,
        protocol: &str,
        params: TestParams,
    ) -> Result<TestContext, FixtureError> {
        let rendered = serde_json::to_string(&params)
            .map_err(|e| FixtureError::Harness(format!("Failed to render params: {}", e)))?;
        tracing::info!("[Fixture] Test {} for {} with {}", name, protocol, rendered);
        Ok(TestContext::new(name, protocol, params))
    }

    async fn run_test(&self, test: TestContext) -> Result<(), FixtureError> {
        if let Some(proxy) = test.sip() {
            tracing::info!("[Fixture] Registrar ready on {}", proxy.local_addr()?);
        }
        tokio::signal::ctrl_c().await?;
        tracing::info!("[Fixture] Interrupted, shutting down {}", test.name);
        Ok(())
    }
}
