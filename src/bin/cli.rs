use std::{
    fs,
    path::{Path, PathBuf},
};

use anyhow::{anyhow, Context, Result};
use axum::{
    body::Body,
    http::{header::HeaderName, HeaderValue, Request, StatusCode},
};
use clap::{Args, Parser, Subcommand};
use itertools::Itertools;
use k8s_openapi::api::core::v1::Secret;
use kube::ResourceExt;
use tracing::Instrument;

use hub_agent::{
    acp::{canonical_policy_name, keys::RemoteKeySets, switcher::HandlerSwitcher, watcher},
    types::{
        acp::AccessControlPolicy,
        testcase::{Case, TestCase},
    },
};

/// Namespace of test objects that do not set one, as with `kubectl apply`.
const DEFAULT_NAMESPACE: &str = "default";

#[derive(Parser, Debug)]
struct Cli {
    #[clap(subcommand)]
    subcommand: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Runs forward-auth test cases against AccessControlPolicies
    Test(TestArgs),
}

#[derive(Args, Debug)]
struct TestArgs {
    #[clap(value_parser)]
    test_case_paths: Vec<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::builder()
                .with_default_directive(tracing_subscriber::filter::LevelFilter::INFO.into())
                .from_env_lossy(),
        )
        .compact()
        .without_time()
        .init();

    let cli = Cli::parse();

    match cli.subcommand {
        Commands::Test(args) => cli_test(args).await,
    }
}

async fn cli_test(args: TestArgs) -> Result<()> {
    for test_case_path in args.test_case_paths {
        let test_case_span =
            tracing::info_span!("test-case-file", path = %test_case_path.display());
        run_test_case(&test_case_path)
            .instrument(test_case_span)
            .await
            .with_context(|| {
                format!(
                    "failed to test for test case file {}",
                    test_case_path.display()
                )
            })?;
    }
    Ok(())
}

async fn run_test_case(test_case_path: &Path) -> Result<()> {
    // Open and deserialize test case file
    let test_case_file = fs::File::open(test_case_path).context("failed to open test case file")?;
    let test_case: TestCase =
        serde_yaml::from_reader(test_case_file).context("failed to deserialize test case")?;
    let test_case_base_path = test_case_path.parent().unwrap_or_else(|| Path::new("."));

    let policies: Vec<AccessControlPolicy> = test_case
        .policies
        .into_iter()
        .map(|fnoo| fnoo.into_objects(test_case_base_path))
        .flatten_ok()
        .try_collect()
        .context("failed to load policies")?;
    let secrets: Vec<Secret> = test_case
        .secrets
        .into_iter()
        .map(|fnoo| fnoo.into_objects(test_case_base_path))
        .flatten_ok()
        .try_collect()
        .context("failed to load secrets")?;

    let switcher = build_switcher(policies, secrets);

    // Evaluate cases
    for (i, case) in test_case.cases.into_iter().enumerate() {
        let case_name = case.name.clone().unwrap_or_else(|| format!("{}", i));
        let case_span = tracing::info_span!("case", case = case_name);
        run_case(&switcher, case)
            .instrument(case_span)
            .await
            .with_context(|| format!("failed to test for case \"{}\"", case_name))?;
    }

    Ok(())
}

/// A switcher serving the given policies, as the auth server would after syncing them.
fn build_switcher(mut policies: Vec<AccessControlPolicy>, mut secrets: Vec<Secret>) -> HandlerSwitcher {
    for policy in &mut policies {
        policy
            .metadata
            .namespace
            .get_or_insert_with(|| DEFAULT_NAMESPACE.to_string());
    }
    for secret in &mut secrets {
        secret
            .metadata
            .namespace
            .get_or_insert_with(|| DEFAULT_NAMESPACE.to_string());
    }
    tracing::debug!(
        policies = %policies.iter().map(|p| p.name_any()).join(","),
        "loading policies"
    );

    let switcher = HandlerSwitcher::default();
    let (policy_watcher, mut rebuilder) = watcher::new(switcher.clone(), RemoteKeySets::default());
    policy_watcher.restart_policies(policies);
    policy_watcher.restart_secrets(secrets);
    rebuilder.rebuild();
    switcher
}

async fn run_case(switcher: &HandlerSwitcher, case: Case) -> Result<()> {
    let policy = canonical_policy_name(&case.policy, DEFAULT_NAMESPACE);

    let mut request = Request::get(format!("/{}", policy))
        .body(Body::empty())
        .context("invalid policy reference")?;
    let headers = request.headers_mut();
    for (name, value) in &case.request.headers {
        let name = HeaderName::from_bytes(name.as_bytes())
            .with_context(|| format!("invalid header name {:?}", name))?;
        let value = HeaderValue::from_str(value)
            .with_context(|| format!("invalid value for header {}", name))?;
        headers.append(name, value);
    }
    for (name, value) in [
        ("x-forwarded-method", &case.request.method),
        ("x-forwarded-uri", &case.request.uri),
    ] {
        if !headers.contains_key(name) {
            headers.insert(
                HeaderName::from_static(name),
                HeaderValue::from_str(value).with_context(|| format!("invalid {}", name))?,
            );
        }
    }

    let response = switcher.serve(request).await;

    let expected_status =
        StatusCode::from_u16(case.expected.status).context("invalid expected status")?;
    if response.status() != expected_status {
        return Err(anyhow!(
            "test failed. `status` expected: {}, actual: {}",
            expected_status,
            response.status()
        ));
    }
    for (name, expected) in &case.expected.headers {
        let actual = response
            .headers()
            .get_all(name.as_str())
            .iter()
            .map(|value| String::from_utf8_lossy(value.as_bytes()).into_owned())
            .join(",");
        if actual != *expected {
            return Err(anyhow!(
                "test failed. header `{}` expected: {:?}, actual: {:?}",
                name,
                expected,
                actual
            ));
        }
    }
    tracing::info!("passed");

    Ok(())
}
