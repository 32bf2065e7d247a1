//! Shared test doubles: mock collaborator clients and archive builders.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::io::{Cursor, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use anyhow::{Result, bail};
use async_trait::async_trait;
use flate2::Compression;
use flate2::write::GzEncoder;

use crate::client::{
    ChartClient, ClientProvider, OciClient, RepoClient, canonical_repo_url,
};
use crate::types::{ChartDetail, RemoteRefs, RevisionMetadata};

/// Build a gzip'd tar archive from `(path, content)` pairs.
pub fn targz(files: &[(&str, &str)]) -> Vec<u8> {
    let mut buf = Vec::new();
    {
        let encoder = GzEncoder::new(Cursor::new(&mut buf), Compression::default());
        let mut tar = tar::Builder::new(encoder);
        for (path, content) in files {
            let mut header = tar::Header::new_gnu();
            header.set_size(content.len() as u64);
            header.set_mode(0o644);
            header.set_cksum();
            tar.append_data(&mut header, path, content.as_bytes())
                .expect("append tar entry");
        }
        let encoder = tar.into_inner().expect("finish tar");
        encoder.finish().expect("finish gzip").flush().expect("flush");
    }
    buf
}

/// Restores scratch-root permissions on drop so tempdirs can clean up
/// after the 0o300 idle mode.
pub struct ScratchGuard {
    path: PathBuf,
}

impl ScratchGuard {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[cfg(unix)]
impl Drop for ScratchGuard {
    fn drop(&mut self) {
        use std::os::unix::fs::PermissionsExt;
        let _ = std::fs::set_permissions(&self.path, std::fs::Permissions::from_mode(0o700));
    }
}

#[cfg(not(unix))]
impl Drop for ScratchGuard {
    fn drop(&mut self) {}
}

#[derive(Default)]
struct RepoState {
    refs: BTreeMap<String, String>,
    present: BTreeSet<String>,
    annotated_tags: BTreeSet<String>,
    tree_contents: BTreeMap<String, Vec<(String, String)>>,
    tree_symlinks: BTreeMap<String, Vec<(String, String)>>,
    changed: BTreeMap<(String, String), Vec<String>>,
    signature: String,
    fail_checkout: Option<(String, String)>,
    fetch_calls: usize,
    ls_remote_calls: usize,
    checkout_calls: Vec<String>,
    current_sha: String,
}

/// Scriptable in-memory repository client.
#[derive(Clone)]
pub struct MockRepoClient {
    url: String,
    root: PathBuf,
    state: Arc<Mutex<RepoState>>,
}

impl MockRepoClient {
    pub fn new(url: &str, root: impl Into<PathBuf>) -> Self {
        Self {
            url: url.to_string(),
            root: root.into(),
            state: Arc::new(Mutex::new(RepoState {
                signature: "good signature".to_string(),
                ..RepoState::default()
            })),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, RepoState> {
        self.state.lock().expect("mock repo state poisoned")
    }

    pub fn add_ref(&self, name: &str, sha: &str) {
        self.lock().refs.insert(name.to_string(), sha.to_string());
    }

    pub fn mark_present(&self, rev: &str) {
        self.lock().present.insert(rev.to_string());
    }

    pub fn mark_annotated(&self, tag: &str) {
        self.lock().annotated_tags.insert(tag.to_string());
    }

    /// Files written into the working tree when `rev` is checked out.
    pub fn set_tree_contents(&self, rev: &str, files: &[(&str, &str)]) {
        self.lock().tree_contents.insert(
            rev.to_string(),
            files
                .iter()
                .map(|(p, c)| (p.to_string(), c.to_string()))
                .collect(),
        );
    }

    /// Symlinks created in the working tree when `rev` is checked out.
    pub fn set_tree_symlink(&self, rev: &str, link_rel: &str, target: &str) {
        self.lock()
            .tree_symlinks
            .entry(rev.to_string())
            .or_default()
            .push((link_rel.to_string(), target.to_string()));
    }

    pub fn set_changed_files(&self, old: &str, new: &str, files: &[&str]) {
        self.lock().changed.insert(
            (old.to_string(), new.to_string()),
            files.iter().map(|f| f.to_string()).collect(),
        );
    }

    pub fn fail_checkout_once(&self, rev: &str, message: &str) {
        self.lock().fail_checkout = Some((rev.to_string(), message.to_string()));
    }

    pub fn fetch_calls(&self) -> usize {
        self.lock().fetch_calls
    }

    pub fn ls_remote_calls(&self) -> usize {
        self.lock().ls_remote_calls
    }

    pub fn checkout_calls(&self) -> Vec<String> {
        self.lock().checkout_calls.clone()
    }
}

#[async_trait]
impl RepoClient for MockRepoClient {
    fn url(&self) -> &str {
        &self.url
    }

    fn root(&self) -> &Path {
        &self.root
    }

    async fn init(&self) -> Result<()> {
        std::fs::create_dir_all(&self.root)?;
        Ok(())
    }

    async fn fetch(&self, refspec: Option<&str>) -> Result<()> {
        let mut state = self.lock();
        state.fetch_calls += 1;
        if let Some(rev) = refspec {
            state.present.insert(rev.to_string());
            state.present.insert("FETCH_HEAD".to_string());
        }
        Ok(())
    }

    async fn checkout(&self, rev: &str, _submodules: bool) -> Result<String> {
        let mut state = self.lock();
        state.checkout_calls.push(rev.to_string());
        if let Some((failing_rev, message)) = state.fail_checkout.clone() {
            if failing_rev == rev {
                state.fail_checkout = None;
                bail!("{message}");
            }
        }
        let sha = state.refs.get(rev).cloned().unwrap_or_else(|| rev.to_string());
        let files = state.tree_contents.get(rev).cloned().unwrap_or_default();
        let symlinks = state.tree_symlinks.get(rev).cloned().unwrap_or_default();
        state.current_sha = sha.clone();
        drop(state);

        for (rel, content) in files {
            let path = self.root.join(rel);
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::write(path, content)?;
        }
        #[cfg(unix)]
        for (rel, target) in symlinks {
            let path = self.root.join(rel);
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            if !path.exists() {
                std::os::unix::fs::symlink(target, path)?;
            }
        }
        #[cfg(not(unix))]
        let _ = symlinks;
        Ok(sha)
    }

    async fn is_revision_present(&self, rev: &str) -> bool {
        self.lock().present.contains(rev)
    }

    async fn ls_remote(&self, rev: &str) -> Result<String> {
        let mut state = self.lock();
        state.ls_remote_calls += 1;
        match state.refs.get(rev) {
            Some(sha) => Ok(sha.clone()),
            None => bail!("unknown ref `{rev}`"),
        }
    }

    async fn ls_refs(&self) -> Result<RemoteRefs> {
        let state = self.lock();
        Ok(RemoteRefs {
            branches: state.refs.clone(),
            tags: BTreeMap::new(),
        })
    }

    async fn ls_files(&self, _pattern: &str) -> Result<Vec<String>> {
        let mut files = Vec::new();
        for entry in walkdir::WalkDir::new(&self.root).follow_links(false) {
            let entry = entry?;
            if entry.file_type().is_file() {
                if let Ok(rel) = entry.path().strip_prefix(&self.root) {
                    files.push(rel.to_string_lossy().to_string());
                }
            }
        }
        files.sort();
        Ok(files)
    }

    async fn revision_metadata(&self, rev: &str) -> Result<RevisionMetadata> {
        Ok(RevisionMetadata {
            author: "Test Author".to_string(),
            date: None,
            tags: vec![],
            message: format!("commit {rev}"),
        })
    }

    async fn verify_commit_signature(&self, rev: &str) -> Result<String> {
        let state = self.lock();
        Ok(format!("{}: {rev}", state.signature))
    }

    async fn changed_files(&self, old: &str, new: &str) -> Result<Vec<String>> {
        Ok(self
            .lock()
            .changed
            .get(&(old.to_string(), new.to_string()))
            .cloned()
            .unwrap_or_default())
    }

    async fn is_annotated_tag(&self, rev: &str) -> bool {
        self.lock().annotated_tags.contains(rev)
    }

    async fn commit_sha(&self) -> Result<String> {
        Ok(self.lock().current_sha.clone())
    }
}

/// Scriptable chart registry client.
#[derive(Clone)]
pub struct MockChartClient {
    url: String,
    versions: Vec<String>,
    archives: Arc<Mutex<BTreeMap<String, Vec<u8>>>>,
}

impl MockChartClient {
    pub fn new(url: &str, versions: &[&str]) -> Self {
        Self {
            url: url.to_string(),
            versions: versions.iter().map(|v| v.to_string()).collect(),
            archives: Arc::new(Mutex::new(BTreeMap::new())),
        }
    }

    pub fn set_archive(&self, version: &str, archive: Vec<u8>) {
        self.archives
            .lock()
            .expect("mock chart archives poisoned")
            .insert(version.to_string(), archive);
    }
}

#[async_trait]
impl ChartClient for MockChartClient {
    fn repo_url(&self) -> &str {
        &self.url
    }

    async fn versions(&self, _chart: &str, _bypass_cache: bool) -> Result<Vec<String>> {
        Ok(self.versions.clone())
    }

    async fn fetch_chart(&self, chart: &str, version: &str) -> Result<Vec<u8>> {
        self.archives
            .lock()
            .expect("mock chart archives poisoned")
            .get(version)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("no archive for {chart} {version}"))
    }

    async fn chart_detail(&self, chart: &str, _version: &str) -> Result<ChartDetail> {
        Ok(ChartDetail {
            description: format!("chart {chart}"),
            ..ChartDetail::default()
        })
    }
}

/// Scriptable OCI registry client.
#[derive(Clone, Default)]
pub struct MockOciClient {
    url: String,
    digests: BTreeMap<String, String>,
    archive: Option<Vec<u8>>,
}

impl MockOciClient {
    pub fn new(url: &str) -> Self {
        Self {
            url: url.to_string(),
            ..Self::default()
        }
    }

    pub fn with_digest(mut self, reference: &str, digest: &str) -> Self {
        self.digests.insert(reference.to_string(), digest.to_string());
        self
    }

    pub fn with_archive(mut self, archive: Vec<u8>) -> Self {
        self.archive = Some(archive);
        self
    }
}

#[async_trait]
impl OciClient for MockOciClient {
    fn repo_url(&self) -> &str {
        &self.url
    }

    async fn resolve_revision(&self, reference: &str, _bypass_cache: bool) -> Result<String> {
        self.digests
            .get(reference)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("unknown reference `{reference}`"))
    }

    async fn tags(&self, _bypass_cache: bool) -> Result<Vec<String>> {
        Ok(self.digests.keys().cloned().collect())
    }

    async fn fetch_archive(&self, digest: &str) -> Result<Vec<u8>> {
        self.archive
            .clone()
            .ok_or_else(|| anyhow::anyhow!("no archive for {digest}"))
    }

    async fn clean_cache(&self, _digest: &str) -> Result<()> {
        Ok(())
    }

    async fn digest_metadata(&self, _digest: &str) -> Result<BTreeMap<String, String>> {
        Ok(BTreeMap::new())
    }
}

/// Provider returning pre-registered clients by canonical URL.
#[derive(Default)]
pub struct StaticProvider {
    repos: HashMap<String, Arc<MockRepoClient>>,
    charts: HashMap<String, Arc<MockChartClient>>,
    ocis: HashMap<String, Arc<MockOciClient>>,
}

impl StaticProvider {
    pub fn with_repo(mut self, repo: MockRepoClient) -> Self {
        self.repos
            .insert(canonical_repo_url(&repo.url), Arc::new(repo));
        self
    }

    pub fn with_chart(mut self, chart: MockChartClient) -> Self {
        self.charts
            .insert(canonical_repo_url(&chart.url), Arc::new(chart));
        self
    }

    pub fn with_oci(mut self, oci: MockOciClient) -> Self {
        self.ocis
            .insert(canonical_repo_url(&oci.url), Arc::new(oci));
        self
    }
}

impl ClientProvider for StaticProvider {
    fn repo_client(&self, url: &str) -> Result<Arc<dyn RepoClient>> {
        match self.repos.get(&canonical_repo_url(url)) {
            Some(client) => Ok(client.clone() as Arc<dyn RepoClient>),
            None => bail!("no repository client registered for {url}"),
        }
    }

    fn chart_client(&self, url: &str) -> Result<Arc<dyn ChartClient>> {
        match self.charts.get(&canonical_repo_url(url)) {
            Some(client) => Ok(client.clone() as Arc<dyn ChartClient>),
            None => bail!("no chart client registered for {url}"),
        }
    }

    fn oci_client(&self, url: &str) -> Result<Arc<dyn OciClient>> {
        match self.ocis.get(&canonical_repo_url(url)) {
            Some(client) => Ok(client.clone() as Arc<dyn OciClient>),
            None => bail!("no OCI client registered for {url}"),
        }
    }
}

/// Mock render engines.
pub mod engines {
    use std::io::Read;
    use std::path::Path;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use anyhow::Result;
    use async_trait::async_trait;
    use serde_json::Value;

    use crate::overlay::{OverlayEngine, OverlayOutput, OverlayRequest};
    use crate::plugin::{
        PluginConfiguration, PluginConnection, PluginDialer, PluginEndpoint, PluginResponse,
        PluginStream,
    };
    use crate::script::{ScriptEngine, ScriptVmSpec};
    use crate::template::{TemplateEngine, TemplateError, TemplateRequest};

    #[derive(Default)]
    struct TemplateState {
        values: Vec<Value>,
        needs_dependency: bool,
        dependency_builds: usize,
        template_calls: usize,
        last_request: Option<TemplateRequest>,
        inline_seen: Option<String>,
    }

    /// Template engine returning canned values, optionally demanding a
    /// dependency build first.
    #[derive(Default)]
    pub struct MockTemplateEngine {
        state: Mutex<TemplateState>,
    }

    impl MockTemplateEngine {
        pub fn returning(values: Vec<Value>) -> Self {
            Self {
                state: Mutex::new(TemplateState {
                    values,
                    ..TemplateState::default()
                }),
            }
        }

        pub fn require_dependency_build(&self) {
            self.lock().needs_dependency = true;
        }

        pub fn dependency_builds(&self) -> usize {
            self.lock().dependency_builds
        }

        pub fn template_calls(&self) -> usize {
            self.lock().template_calls
        }

        pub fn last_request(&self) -> Option<TemplateRequest> {
            self.lock().last_request.clone()
        }

        pub fn inline_values_seen(&self) -> Option<String> {
            self.lock().inline_seen.clone()
        }

        fn lock(&self) -> std::sync::MutexGuard<'_, TemplateState> {
            self.state.lock().expect("mock template state poisoned")
        }
    }

    #[async_trait]
    impl TemplateEngine for MockTemplateEngine {
        async fn template(&self, request: &TemplateRequest) -> Result<Vec<Value>, TemplateError> {
            let inline = request
                .inline_values_file
                .as_ref()
                .and_then(|p| std::fs::read_to_string(p).ok());
            let mut state = self.lock();
            state.template_calls += 1;
            state.last_request = Some(request.clone());
            if inline.is_some() {
                state.inline_seen = inline;
            }
            if state.needs_dependency {
                return Err(TemplateError::MissingDependency);
            }
            Ok(state.values.clone())
        }

        async fn dependency_build(&self, _chart_dir: &Path) -> Result<(), TemplateError> {
            let mut state = self.lock();
            state.dependency_builds += 1;
            state.needs_dependency = false;
            Ok(())
        }
    }

    struct FailingOverlayEngine;

    #[async_trait]
    impl OverlayEngine for FailingOverlayEngine {
        async fn build(&self, _request: &OverlayRequest) -> Result<OverlayOutput> {
            anyhow::bail!("overlay build failed")
        }
    }

    /// An overlay engine that always fails.
    pub fn failing_overlay() -> impl OverlayEngine {
        FailingOverlayEngine
    }

    /// Overlay engine counting invocations, optionally failing each one.
    pub struct CountingOverlayEngine {
        manifests: Vec<Value>,
        fail_with: Option<String>,
        fail_with_path: bool,
        delay: Duration,
        calls: Mutex<usize>,
    }

    impl CountingOverlayEngine {
        pub fn returning(manifests: Vec<Value>) -> Self {
            Self {
                manifests,
                fail_with: None,
                fail_with_path: false,
                delay: Duration::ZERO,
                calls: Mutex::new(0),
            }
        }

        pub fn failing(message: &str) -> Self {
            Self {
                manifests: Vec::new(),
                fail_with: Some(message.to_string()),
                fail_with_path: false,
                delay: Duration::ZERO,
                calls: Mutex::new(0),
            }
        }

        /// Fail with a message embedding the absolute build path, the way
        /// real engines leak paths into their stderr.
        pub fn failing_with_path() -> Self {
            Self {
                manifests: Vec::new(),
                fail_with: None,
                fail_with_path: true,
                delay: Duration::ZERO,
                calls: Mutex::new(0),
            }
        }

        pub fn with_delay(mut self, delay: Duration) -> Self {
            self.delay = delay;
            self
        }

        pub fn calls(&self) -> usize {
            *self.calls.lock().expect("overlay calls poisoned")
        }
    }

    #[async_trait]
    impl OverlayEngine for CountingOverlayEngine {
        async fn build(&self, request: &OverlayRequest) -> Result<OverlayOutput> {
            *self.calls.lock().expect("overlay calls poisoned") += 1;
            if self.delay > Duration::ZERO {
                tokio::time::sleep(self.delay).await;
            }
            if self.fail_with_path {
                anyhow::bail!("build failed in {}", request.path.display());
            }
            if let Some(message) = &self.fail_with {
                anyhow::bail!("{message}");
            }
            Ok(OverlayOutput {
                manifests: self.manifests.clone(),
                images: Vec::new(),
            })
        }
    }

    /// Script engine that parses the target file as JSON; tests write JSON
    /// into `.jsonnet` fixtures.
    pub struct StaticScriptEngine;

    impl StaticScriptEngine {
        pub fn parse_json() -> Self {
            Self
        }
    }

    #[async_trait]
    impl ScriptEngine for StaticScriptEngine {
        async fn evaluate(&self, file: &Path, _vm: &ScriptVmSpec) -> Result<Value> {
            let content = std::fs::read_to_string(file)?;
            Ok(serde_json::from_str(&content)?)
        }
    }

    #[derive(Default)]
    struct PluginCallState {
        received_bytes: usize,
        entry_names: Vec<String>,
        env_seen: Vec<(String, String)>,
    }

    /// Plugin connection that consumes the archive, optionally sleeps, and
    /// replies with canned manifests.
    pub struct MockPluginConnection {
        manifests: Vec<String>,
        delay: Duration,
        fail_with: Option<String>,
        matches: bool,
        requires_creds: bool,
        state: Mutex<PluginCallState>,
    }

    impl MockPluginConnection {
        pub fn new(manifests: Vec<String>, delay: Duration) -> Self {
            Self {
                manifests,
                delay,
                fail_with: None,
                matches: false,
                requires_creds: false,
                state: Mutex::new(PluginCallState::default()),
            }
        }

        pub fn failing(mut self, message: &str) -> Self {
            self.fail_with = Some(message.to_string());
            self
        }

        pub fn matching(mut self, matches: bool) -> Self {
            self.matches = matches;
            self
        }

        pub fn requiring_credentials(mut self) -> Self {
            self.requires_creds = true;
            self
        }

        pub fn received_bytes(&self) -> usize {
            self.state.lock().expect("plugin state").received_bytes
        }

        pub fn received_entry_names(&self) -> Vec<String> {
            self.state.lock().expect("plugin state").entry_names.clone()
        }

        pub fn env_seen(&self) -> Vec<(String, String)> {
            self.state.lock().expect("plugin state").env_seen.clone()
        }
    }

    #[async_trait]
    impl PluginConnection for MockPluginConnection {
        async fn check_configuration(&self) -> Result<PluginConfiguration> {
            Ok(PluginConfiguration {
                requires_repo_credentials: self.requires_creds,
            })
        }

        async fn match_repository(&self, _root: &Path) -> Result<bool> {
            Ok(self.matches)
        }

        async fn generate_manifests(&self, mut stream: PluginStream) -> Result<PluginResponse> {
            let mut archive = Vec::new();
            while let Some(chunk) = stream.chunks.recv().await {
                archive.extend_from_slice(&chunk);
            }

            let mut entry_names = Vec::new();
            let mut tar = tar::Archive::new(flate2::read::GzDecoder::new(archive.as_slice()));
            if let Ok(entries) = tar.entries() {
                for entry in entries.flatten() {
                    let mut entry = entry;
                    if let Ok(path) = entry.path() {
                        entry_names.push(path.to_string_lossy().to_string());
                    }
                    let mut sink = Vec::new();
                    let _ = entry.read_to_end(&mut sink);
                }
            }

            {
                let mut state = self.state.lock().expect("plugin state");
                state.received_bytes = archive.len();
                state.entry_names = entry_names;
                state.env_seen = stream
                    .env
                    .iter()
                    .map(|e| (e.name.clone(), e.value.clone()))
                    .collect();
            }

            if self.delay > Duration::ZERO {
                tokio::time::sleep(self.delay).await;
            }
            if let Some(message) = &self.fail_with {
                anyhow::bail!("{message}");
            }
            Ok(PluginResponse {
                manifests: self.manifests.clone(),
            })
        }
    }

    /// Dialer handing out pre-registered connections by plugin name.
    #[derive(Default)]
    pub struct MockDialer {
        connections: std::collections::HashMap<String, Arc<MockPluginConnection>>,
    }

    impl MockDialer {
        pub fn single(name: &str, connection: Arc<MockPluginConnection>) -> Self {
            let mut connections = std::collections::HashMap::new();
            connections.insert(name.to_string(), connection);
            Self { connections }
        }
    }

    impl PluginDialer for MockDialer {
        fn connect(&self, endpoint: &PluginEndpoint) -> Result<Arc<dyn PluginConnection>> {
            match self.connections.get(&endpoint.name) {
                Some(connection) => Ok(connection.clone() as Arc<dyn PluginConnection>),
                None => anyhow::bail!("no mock connection for `{}`", endpoint.name),
            }
        }
    }
}
