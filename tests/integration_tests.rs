//! Integration tests for the certificate authority, leaf issuer and lifecycle

use netmiddler::ca::{CaManager, EnsureOutcome, LeafIssuer, MemoryTrustStore, RootCredential, TrustStore};
use netmiddler::proxy::ObserverHandler;
use netmiddler::sysproxy::{MemorySystemProxy, RedirectControl, SystemProxyConfigurator};
use netmiddler::{Lifecycle, MitmConfig};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_rustls::rustls::client::danger::ServerCertVerifier;
use tokio_rustls::rustls::client::WebPkiServerVerifier;
use tokio_rustls::rustls::pki_types::{ServerName, UnixTime};
use tokio_rustls::rustls::RootCertStore;

fn temp_dir(name: &str) -> PathBuf {
  let dir = std::env::temp_dir().join(name);
  if dir.exists() {
    std::fs::remove_dir_all(&dir).ok();
  }
  dir
}

fn verifier_for(root: &RootCredential) -> Arc<WebPkiServerVerifier> {
  let mut roots = RootCertStore::empty();
  roots.add(root.cert_der().clone()).unwrap();
  WebPkiServerVerifier::builder_with_provider(
    Arc::new(roots),
    Arc::new(tokio_rustls::rustls::crypto::ring::default_provider()),
  )
  .build()
  .unwrap()
}

#[tokio::test]
async fn test_distinct_hosts_verify_against_root() {
  let root = Arc::new(RootCredential::generate().unwrap());
  let issuer = LeafIssuer::new(root.clone(), Duration::from_secs(24 * 3600), 16);
  let verifier = verifier_for(&root);

  let first = issuer.issue("alpha.example").await.unwrap();
  let second = issuer.issue("beta.example").await.unwrap();
  assert_ne!(first.cert_chain()[0], second.cert_chain()[0]);

  for (leaf, host) in [(&first, "alpha.example"), (&second, "beta.example")] {
    let name = ServerName::try_from(host.to_string()).unwrap();
    let verified = verifier.verify_server_cert(&leaf.cert_chain()[0], &[], &name, &[], UnixTime::now());
    assert!(verified.is_ok(), "leaf for {} rejected: {:?}", host, verified.err());
  }

  // A leaf must not validate for another host.
  let other = ServerName::try_from("beta.example".to_string()).unwrap();
  assert!(verifier
    .verify_server_cert(&first.cert_chain()[0], &[], &other, &[], UnixTime::now())
    .is_err());
}

#[tokio::test]
async fn test_leaf_is_cached_per_host() {
  let root = Arc::new(RootCredential::generate().unwrap());
  let issuer = LeafIssuer::new(root, Duration::from_secs(24 * 3600), 16);

  let first = issuer.issue("cached.example").await.unwrap();
  let second = issuer.issue("CACHED.example.").await.unwrap();
  assert!(Arc::ptr_eq(&first, &second), "expected the cached credential");
  assert_eq!(issuer.issued_count(), 1);
}

#[tokio::test]
async fn test_concurrent_issue_signs_once() {
  let root = Arc::new(RootCredential::generate().unwrap());
  let issuer = Arc::new(LeafIssuer::new(root, Duration::from_secs(24 * 3600), 16));

  let tasks: Vec<_> = (0..8)
    .map(|_| {
      let issuer = issuer.clone();
      tokio::spawn(async move { issuer.issue("busy.example").await })
    })
    .collect();
  let leaves: Vec<_> = futures::future::join_all(tasks)
    .await
    .into_iter()
    .map(|r| r.unwrap().unwrap())
    .collect();

  assert_eq!(issuer.issued_count(), 1);
  assert!(leaves.iter().all(|leaf| Arc::ptr_eq(leaf, &leaves[0])));
}

#[tokio::test]
async fn test_expired_leaf_is_reissued() {
  let root = Arc::new(RootCredential::generate().unwrap());
  let issuer = LeafIssuer::new(root.clone(), Duration::from_secs(2), 16);

  let first = issuer.issue("short.example").await.unwrap();
  tokio::time::sleep(Duration::from_millis(2500)).await;
  let second = issuer.issue("short.example").await.unwrap();

  assert!(!Arc::ptr_eq(&first, &second));
  assert_eq!(issuer.issued_count(), 2);
  assert!(second.expires_at() > first.expires_at());

  let name = ServerName::try_from("short.example".to_string()).unwrap();
  let verified = verifier_for(&root).verify_server_cert(&second.cert_chain()[0], &[], &name, &[], UnixTime::now());
  assert!(verified.is_ok(), "reissued leaf rejected: {:?}", verified.err());
}

#[tokio::test]
async fn test_ensure_is_idempotent_and_uninstall_removes_root() {
  let dir = temp_dir("netmiddler-test-ensure");
  let system = Arc::new(MemoryTrustStore::new("system"));
  let java = Arc::new(MemoryTrustStore::optional("java"));
  let stores: Vec<Arc<dyn TrustStore>> = vec![system.clone(), java.clone()];
  let manager = CaManager::new(&dir, stores);

  assert_eq!(manager.ensure(false).await.unwrap(), EnsureOutcome::Created);
  assert_eq!(manager.ensure(false).await.unwrap(), EnsureOutcome::Existing);
  assert_eq!(system.install_count(), 1);
  assert_eq!(java.install_count(), 1);

  let pem = std::fs::read_to_string(manager.ca_cert_path()).unwrap();
  assert!(pem.contains("BEGIN CERTIFICATE"));
  assert!(system.trusts(&pem));
  let root = manager.load().await.unwrap();
  assert!(root.common_name().starts_with("DO_NOT_TRUST_"));

  assert_eq!(manager.ensure(true).await.unwrap(), EnsureOutcome::Uninstalled);
  assert!(!manager.paths().cert.exists());
  assert!(!manager.paths().key.exists());
  assert_eq!(system.trusted_count(), 0);
  assert_eq!(java.trusted_count(), 0);

  std::fs::remove_dir_all(&dir).ok();
}

#[tokio::test]
async fn test_missing_key_regenerates_root() {
  let dir = temp_dir("netmiddler-test-missing-key");
  let system = Arc::new(MemoryTrustStore::new("system"));
  let manager = CaManager::new(&dir, vec![system.clone() as Arc<dyn TrustStore>]);

  manager.ensure(false).await.unwrap();
  let old_pem = std::fs::read_to_string(manager.ca_cert_path()).unwrap();
  std::fs::remove_file(&manager.paths().key).unwrap();

  assert_eq!(manager.ensure(false).await.unwrap(), EnsureOutcome::Created);
  let new_pem = std::fs::read_to_string(manager.ca_cert_path()).unwrap();
  assert_ne!(old_pem, new_pem);
  assert!(!system.trusts(&old_pem), "stale root must be untrusted");
  assert!(system.trusts(&new_pem));
  assert_eq!(system.trusted_count(), 1);

  std::fs::remove_dir_all(&dir).ok();
}

#[tokio::test]
async fn test_failed_trust_install_is_fatal() {
  let dir = temp_dir("netmiddler-test-install-fails");
  let stores: Vec<Arc<dyn TrustStore>> = vec![Arc::new(MemoryTrustStore::new("system").failing())];
  let manager = CaManager::new(&dir, stores);

  let err = manager.ensure(false).await.unwrap_err();
  assert!(err.is_setup());
  assert!(!manager.paths().cert.exists(), "untrusted root must not stay on disk");

  std::fs::remove_dir_all(&dir).ok();
}

fn lifecycle(
  dir: &PathBuf,
  backend: MemorySystemProxy,
) -> (Lifecycle, Arc<SystemProxyConfigurator<MemorySystemProxy>>) {
  let config = MitmConfig::default().with_port(0).with_ca_storage_path(dir);
  let ca = CaManager::new(dir, vec![Arc::new(MemoryTrustStore::new("system")) as Arc<dyn TrustStore>]);
  let redirect = Arc::new(SystemProxyConfigurator::new(backend));
  let control: Arc<dyn RedirectControl> = redirect.clone();
  (Lifecycle::new(config, ca, control, ObserverHandler::new()), redirect)
}

#[tokio::test]
async fn test_lifecycle_restores_proxy_once() {
  let dir = temp_dir("netmiddler-test-lifecycle");
  let (lifecycle, redirect) = lifecycle(&dir, MemorySystemProxy::with_setting(Some("corp:3128".into())));

  lifecycle
    .run_until(tokio::time::sleep(Duration::from_millis(300)))
    .await
    .unwrap();

  let backend = redirect.backend();
  assert_eq!(backend.apply_count(), 1);
  assert_eq!(backend.restore_count(), 1);
  assert_eq!(backend.current().as_deref(), Some("corp:3128"));
  assert!(!redirect.is_active());

  std::fs::remove_dir_all(&dir).ok();
}

#[tokio::test]
async fn test_shutdown_during_startup_still_restores_once() {
  let dir = temp_dir("netmiddler-test-lifecycle-early-stop");
  let (lifecycle, redirect) = lifecycle(&dir, MemorySystemProxy::default());

  lifecycle.run_until(async {}).await.unwrap();

  let backend = redirect.backend();
  assert_eq!(backend.restore_count(), 1);
  assert_eq!(backend.current(), None);

  std::fs::remove_dir_all(&dir).ok();
}

#[tokio::test]
async fn test_failed_enable_is_fatal_and_rolled_back() {
  let dir = temp_dir("netmiddler-test-lifecycle-enable-fails");
  let backend = MemorySystemProxy::with_setting(Some("corp:3128".into())).failing_apply();
  let (lifecycle, redirect) = lifecycle(&dir, backend);

  let err = lifecycle
    .run_until(std::future::pending::<()>())
    .await
    .unwrap_err();
  assert!(err.is_setup());

  let backend = redirect.backend();
  assert_eq!(backend.restore_count(), 1);
  assert_eq!(backend.current().as_deref(), Some("corp:3128"));

  std::fs::remove_dir_all(&dir).ok();
}
