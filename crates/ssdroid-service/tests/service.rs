#![cfg(unix)]

use std::{
    io::{self, ErrorKind},
    net::IpAddr,
    os::unix::fs::PermissionsExt,
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
    time::Duration,
};

use async_trait::async_trait;
use ssdroid_service::{
    acl::{Acl, Route, RuleFetcher},
    config::ServiceConfig,
    core::variant_from_config,
    dns::{LocalResolve, LocalResolver},
    process::NoopProcessScanner,
    ServiceCallback,
    ServiceCore,
    State,
};
use tokio::time;
use url::Url;

#[derive(Default)]
struct Recorder(Mutex<Vec<(State, Option<String>)>>);

impl Recorder {
    fn events(&self) -> Vec<(State, Option<String>)> {
        self.0.lock().unwrap().clone()
    }
}

impl ServiceCallback for Recorder {
    fn state_changed(&self, state: State, profile_name: &str, msg: Option<&str>) {
        assert_eq!(profile_name, "test profile");
        self.0.lock().unwrap().push((state, msg.map(ToOwned::to_owned)));
    }
}

struct NoResolver;

#[async_trait]
impl LocalResolve for NoResolver {
    async fn resolve(&self, host: &str) -> io::Result<Vec<IpAddr>> {
        Err(io::Error::new(ErrorKind::NotFound, format!("{host} not found")))
    }
}

struct StaticFetcher;

#[async_trait]
impl RuleFetcher for StaticFetcher {
    async fn fetch(&self, url: &Url) -> io::Result<String> {
        match url.as_str() {
            "http://rules.example/extra.acl" => Ok("(^|\\.)imported\\.example$\n".to_owned()),
            _ => Err(io::Error::new(ErrorKind::NotFound, url.to_string())),
        }
    }
}

fn sandbox(name: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!("ssdroid-service-{}-{}", name, std::process::id()));
    let _ = std::fs::remove_dir_all(&dir);
    std::fs::create_dir_all(&dir).unwrap();
    dir
}

fn write_script(dir: &Path, name: &str, body: &str) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    path
}

fn config(sandbox: &Path, executable: &Path, extra: &str) -> ServiceConfig {
    ServiceConfig::load_from_str(&format!(
        r#"{{
            profile_name: "test profile",
            sandbox_dir: {sandbox:?},
            proxy: {{ executable: {executable:?} }},
            dns: {{ local_address: "127.0.0.1", local_port: 0, remote_dns: "127.0.0.1:9" }},
            {extra}
        }}"#
    ))
    .unwrap()
}

fn service_core(config: ServiceConfig, recorder: Arc<Recorder>) -> Arc<ServiceCore> {
    let variant = variant_from_config(&config.variant);
    let mut core = ServiceCore::new(config, variant, recorder);
    core.set_scanner(Arc::new(NoopProcessScanner));
    core.set_fetcher(Arc::new(StaticFetcher));
    core.set_resolver(Arc::new(LocalResolver::custom_resolver(NoResolver)));
    Arc::new(core)
}

async fn wait_state(core: &ServiceCore, state: State) {
    let mut rx = core.subscribe();
    time::timeout(Duration::from_secs(10), rx.wait_for(|s| *s == state))
        .await
        .unwrap()
        .unwrap();
}

#[tokio::test]
async fn connects_and_stops() {
    let _ = env_logger::try_init();

    let dir = sandbox("connects");
    let proxy = write_script(&dir, "proxy", "exec sleep 30");
    let recorder = Arc::new(Recorder::default());
    let core = service_core(config(&dir, &proxy, ""), recorder.clone());

    assert_eq!(core.state(), State::Stopped);
    assert!(core.start());
    assert!(!core.start());

    wait_state(&core, State::Connected).await;
    assert!(core.state().can_stop());

    core.stop(None).await;
    assert_eq!(core.state(), State::Stopped);
    assert_eq!(
        recorder.events(),
        [
            (State::Connecting, None),
            (State::Connected, None),
            (State::Stopping, None),
            (State::Stopped, None),
        ]
    );

    // restartable once stopped
    assert!(core.start());
    wait_state(&core, State::Connected).await;
    core.stop(None).await;

    std::fs::remove_dir_all(&dir).unwrap();
}

#[tokio::test]
async fn crashing_proxy_stops_service() {
    let _ = env_logger::try_init();

    let dir = sandbox("crashing");
    let proxy = write_script(&dir, "proxy", "exit 1");
    let recorder = Arc::new(Recorder::default());
    let core = service_core(config(&dir, &proxy, ""), recorder.clone());

    assert!(core.start());
    wait_state(&core, State::Stopped).await;

    let events = recorder.events();
    let (state, msg) = events.last().unwrap();
    assert_eq!(*state, State::Stopped);
    assert_eq!(msg.as_deref(), Some("proxy exits too fast"));

    std::fs::remove_dir_all(&dir).unwrap();
}

#[tokio::test]
async fn missing_executable_fails_start() {
    let _ = env_logger::try_init();

    let dir = sandbox("missing");
    let recorder = Arc::new(Recorder::default());
    let core = service_core(config(&dir, &dir.join("no-such-proxy"), ""), recorder.clone());

    assert!(core.start());
    wait_state(&core, State::Stopped).await;

    let events = recorder.events();
    assert_eq!(events.first(), Some(&(State::Connecting, None)));
    assert!(!events.iter().any(|(s, _)| *s == State::Connected));
    let (state, msg) = events.last().unwrap();
    assert_eq!(*state, State::Stopped);
    assert!(msg.as_deref().unwrap().starts_with("service failed:"));

    std::fs::remove_dir_all(&dir).unwrap();
}

#[tokio::test]
async fn custom_rules_are_flattened_and_saved() {
    let _ = env_logger::try_init();

    let dir = sandbox("custom-rules");
    let proxy = write_script(&dir, "proxy", "exec sleep 30");
    let recorder = Arc::new(Recorder::default());
    let core = service_core(
        config(
            &dir,
            &proxy,
            r#"acl: {
                route: "custom-rules",
                custom_rules: "1.2.3.4\n#IMPORT_URL <http://rules.example/extra.acl>\n",
            }"#,
        ),
        recorder,
    );

    assert!(core.start());
    wait_state(&core, State::Connected).await;

    let saved = core.acl_store().load(Route::CustomRules.as_str()).unwrap();
    assert!(saved.bypass);
    assert!(saved.urls.is_empty());
    assert!(saved.proxy_hostnames.contains("(^|\\.)imported\\.example$"));
    assert_eq!(saved.subnets.len(), 1);
    assert_eq!(saved, Acl::custom_rules(Some("1.2.3.4\n(^|\\.)imported\\.example$\n")));

    core.stop(None).await;
    std::fs::remove_dir_all(&dir).unwrap();
}
