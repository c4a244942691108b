use super::{
    network::Network,
    storage::CacheStorage,
    types::{CacheError, CacheMode, FetchDecision, FetchRequest, FetchResponse, RequestMode},
};
use axum::http::{Method, StatusCode};
use futures::future::{join_all, try_join_all};
use std::sync::Arc;
use tokio::{sync::watch, task::JoinHandle};
use tracing::{debug, info, warn};
use url::Url;

const OFFLINE_PAGE: &str =
    "<html><body><h1>Offline</h1><p>Please check your connection.</p></body></html>";

/// Lifecycle of one deployed controller version.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Parsed,
    Installing,
    Installed,
    Activating,
    Activated,
    Redundant,
}

/// Routing and caching policy for one deployment.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Origin whose requests are intercepted.
    pub origin: Url,
    /// Baked into partition names; bump it to invalidate everything.
    pub version: String,
    /// Root-relative paths fetched at install time.
    pub critical_assets: Vec<String>,
    /// Filename stems of the split bundles (`runtime.abc123.js`, ...).
    pub bundle_stems: Vec<String>,
    pub asset_extensions: Vec<String>,
    /// Path fragments whose requests are treated as cacheable assets.
    pub asset_paths: Vec<String>,
    /// Cross-origin hosts that are intercepted with network-first.
    pub cdn_hosts: Vec<String>,
}

impl CacheConfig {
    /// Policy for the TripBasket web app.
    pub fn tripbasket(origin: Url, version: impl Into<String>) -> Self {
        let strings = |items: &[&str]| -> Vec<String> { items.iter().map(|s| s.to_string()).collect() };
        Self {
            origin,
            version: version.into(),
            critical_assets: strings(&[
                "/",
                "/flutter.js",
                "/main.dart.js",
                "/assets/AssetManifest.json",
                "/assets/FontManifest.json",
                "/assets/images/optimized/200611101955-01-egypt-dahab.webp",
                "/manifest.json",
            ]),
            bundle_stems: strings(&["runtime", "vendor", "main", "app"]),
            asset_extensions: strings(&["js", "css", "woff", "woff2", "ttf", "webp"]),
            asset_paths: strings(&["/assets/images/optimized/", "/icons/"]),
            cdn_hosts: strings(&["fonts.googleapis.com", "fonts.gstatic.com", "www.gstatic.com"]),
        }
    }

    pub fn static_partition(&self) -> String {
        format!("tripbasket-static-{}", self.version)
    }

    pub fn dynamic_partition(&self) -> String {
        format!("tripbasket-dynamic-{}", self.version)
    }

    fn is_critical(&self, path: &str) -> bool {
        path == "/" || self.critical_assets.iter().any(|asset| asset == path)
    }

    /// `runtime.<hash>.js`, `vendor-<hash>.js` and friends.
    fn is_bundle(&self, path: &str) -> bool {
        let file = file_name(path);
        let Some(stem) = file.strip_suffix(".js") else {
            return false;
        };
        self.bundle_stems.iter().any(|bundle| {
            stem.strip_prefix(bundle.as_str())
                .is_some_and(|rest| rest.starts_with(['.', '-']))
        })
    }

    fn is_asset(&self, url: &Url) -> bool {
        let path = url.path();
        let extension_match = extension(path)
            .is_some_and(|ext| self.asset_extensions.iter().any(|e| e.eq_ignore_ascii_case(ext)));
        extension_match || self.asset_paths.iter().any(|p| path.contains(p.as_str()))
    }

    fn is_cdn(&self, url: &Url) -> bool {
        url.host_str()
            .is_some_and(|host| self.cdn_hosts.iter().any(|cdn| cdn == host))
    }
}

fn file_name(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

fn extension(path: &str) -> Option<&str> {
    file_name(path).rsplit_once('.').map(|(_, ext)| ext)
}

/// Empty stand-in served when a script or stylesheet cannot be fetched.
fn synthetic_fallback(request: &FetchRequest) -> Option<FetchResponse> {
    let content_type = match extension(request.path()) {
        Some("js") => "application/javascript",
        Some("css") => "text/css",
        _ => return None,
    };
    Some(FetchResponse::new(StatusCode::OK, request.url.clone(), "").with_content_type(content_type))
}

fn offline_page(request: &FetchRequest) -> FetchResponse {
    FetchResponse::new(StatusCode::SERVICE_UNAVAILABLE, request.url.clone(), OFFLINE_PAGE)
        .with_content_type("text/html; charset=utf-8")
}

/// Install/activate/fetch policy of the web app's offline cache.
///
/// Cheap to clone; clones share the cache, network and lifecycle state.
#[derive(Clone)]
pub struct CacheController {
    config: Arc<CacheConfig>,
    cache: Arc<dyn CacheStorage>,
    network: Arc<dyn Network>,
    state: Arc<watch::Sender<WorkerState>>,
}

impl CacheController {
    pub fn new(config: CacheConfig, cache: Arc<dyn CacheStorage>, network: Arc<dyn Network>) -> Self {
        let (state, _) = watch::channel(WorkerState::Parsed);
        Self {
            config: Arc::new(config),
            cache,
            network,
            state: Arc::new(state),
        }
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    pub fn network(&self) -> &Arc<dyn Network> {
        &self.network
    }

    pub fn state(&self) -> WorkerState {
        *self.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<WorkerState> {
        self.state.subscribe()
    }

    fn transition(&self, next: WorkerState) {
        let previous = self.state.send_replace(next);
        debug!(?previous, ?next, "cache controller state change");
    }

    fn absolute(&self, path: &str) -> Result<Url, CacheError> {
        self.config.origin.join(path).map_err(|err| CacheError::Install {
            url: path.to_string(),
            reason: err.to_string(),
        })
    }

    /// Populate the static partition with every critical asset.
    ///
    /// All-or-nothing: entries are written only after every fetch returned
    /// 200, and any failure fails the install. On success the new version
    /// does not wait for old pages to close.
    pub async fn install(&self) -> Result<(), CacheError> {
        self.transition(WorkerState::Installing);
        info!(version = %self.config.version, "installing cache controller");

        let result = self.populate_static().await;
        match &result {
            Ok(count) => {
                info!(count, "critical assets cached");
                self.transition(WorkerState::Installed);
            }
            Err(err) => {
                warn!("install failed: {}", err);
                self.transition(WorkerState::Redundant);
            }
        }
        result.map(|_| ())
    }

    async fn populate_static(&self) -> Result<usize, CacheError> {
        let partition = self.config.static_partition();
        self.cache.open(&partition).await?;

        let requests = self
            .config
            .critical_assets
            .iter()
            .map(|path| self.absolute(path).map(FetchRequest::get))
            .collect::<Result<Vec<_>, _>>()?;

        let fetched = try_join_all(requests.into_iter().map(|request| async move {
            let response = self.network.fetch(&request, CacheMode::Reload).await?;
            if !response.is_ok() {
                return Err(CacheError::Install {
                    url: request.url.to_string(),
                    reason: response.status.to_string(),
                });
            }
            Ok::<_, CacheError>((request, response))
        }))
        .await?;

        let count = fetched.len();
        for (request, response) in fetched {
            self.cache.put(&partition, &request, response).await?;
        }
        Ok(count)
    }

    /// Delete every partition that does not belong to this version, then
    /// take control of open clients.
    pub async fn activate(&self) -> Result<(), CacheError> {
        self.transition(WorkerState::Activating);
        info!(version = %self.config.version, "activating cache controller");

        let keep = [self.config.static_partition(), self.config.dynamic_partition()];
        for name in self.cache.keys().await? {
            if !keep.contains(&name) {
                info!(partition = %name, "deleting old cache");
                self.cache.delete(&name).await?;
            }
        }

        self.transition(WorkerState::Activated);
        info!("clients claimed");
        Ok(())
    }

    /// Route an intercepted request. First matching rule wins.
    pub async fn handle_fetch(&self, request: FetchRequest) -> FetchDecision {
        if request.method != Method::GET {
            return FetchDecision::Passthrough;
        }

        let same_origin = request.url.origin() == self.config.origin.origin();
        if !same_origin {
            if self.config.is_cdn(&request.url) {
                return FetchDecision::Respond(self.network_first(&request).await);
            }
            return FetchDecision::Passthrough;
        }

        let path = request.path();
        let result = if self.config.is_critical(path) || self.config.is_bundle(path) {
            let partition = self.config.static_partition();
            self.cache_first(&request, &partition).await
        } else if self.config.is_asset(&request.url) {
            let partition = self.config.dynamic_partition();
            self.cache_first(&request, &partition).await
        } else {
            self.network_first(&request).await
        };

        let result = match result {
            Err(err) if request.mode == RequestMode::Navigate && request.path() == "/" => {
                warn!("serving offline page: {}", err);
                Ok(offline_page(&request))
            }
            other => other,
        };
        FetchDecision::Respond(result)
    }

    /// Serve from `partition`, falling back to the network on a miss.
    pub async fn cache_first(
        &self,
        request: &FetchRequest,
        partition: &str,
    ) -> Result<FetchResponse, CacheError> {
        match self.cache.match_in(partition, request).await {
            Ok(Some(cached)) => {
                debug!(url = %request.url, partition, "serving from cache");
                if self.config.is_critical(request.path()) {
                    self.background_refresh(request.clone(), partition.to_string());
                }
                return Ok(cached);
            }
            Ok(None) => {}
            Err(err) => warn!(partition, "cache lookup failed: {}", err),
        }

        match self.network.fetch(request, CacheMode::Default).await {
            Ok(response) => {
                if response.is_ok() {
                    if let Err(err) = self.cache.put(partition, request, response.clone()).await {
                        warn!(url = %request.url, "failed to cache response: {}", err);
                    }
                }
                Ok(response)
            }
            Err(err) => synthetic_fallback(request).ok_or(err),
        }
    }

    /// Go to the network, falling back to any cached copy of the request.
    pub async fn network_first(&self, request: &FetchRequest) -> Result<FetchResponse, CacheError> {
        match self.network.fetch(request, CacheMode::Default).await {
            Ok(response) => {
                if response.is_ok() && self.config.is_asset(&request.url) {
                    let cache = Arc::clone(&self.cache);
                    let partition = self.config.dynamic_partition();
                    let request = request.clone();
                    let copy = response.clone();
                    tokio::spawn(async move {
                        if let Err(err) = cache.put(&partition, &request, copy).await {
                            warn!(url = %request.url, "failed to cache response: {}", err);
                        }
                    });
                }
                Ok(response)
            }
            Err(err) => match self.cache.match_any(request).await {
                Ok(Some(cached)) => {
                    debug!(url = %request.url, "network failed, serving cached copy");
                    Ok(cached)
                }
                Ok(None) => Err(err),
                Err(cache_err) => {
                    warn!(url = %request.url, "cache fallback failed: {}", cache_err);
                    Err(err)
                }
            },
        }
    }

    /// Refetch `request` bypassing caches and overwrite its entry. Detached:
    /// failures are logged and go nowhere else.
    pub fn background_refresh(&self, request: FetchRequest, partition: String) -> JoinHandle<()> {
        let cache = Arc::clone(&self.cache);
        let network = Arc::clone(&self.network);
        tokio::spawn(async move {
            match network.fetch(&request, CacheMode::Reload).await {
                Ok(response) if response.is_ok() => {
                    if let Err(err) = cache.put(&partition, &request, response).await {
                        warn!(url = %request.url, "background refresh not stored: {}", err);
                    } else {
                        debug!(url = %request.url, "background refresh stored");
                    }
                }
                Ok(response) => {
                    debug!(url = %request.url, status = %response.status, "background refresh skipped");
                }
                Err(err) => warn!(url = %request.url, "background refresh failed: {}", err),
            }
        })
    }

    /// Refetch every critical asset and overwrite its static entry. Returns
    /// how many were refreshed; individual failures are logged.
    pub async fn refresh_critical_assets(&self) -> usize {
        let partition = self.config.static_partition();
        let refreshes = self.config.critical_assets.iter().map(|path| {
            let partition = partition.as_str();
            async move {
                let request = FetchRequest::get(self.absolute(path)?);
                let response = self.network.fetch(&request, CacheMode::Reload).await?;
                if !response.is_ok() {
                    return Ok(false);
                }
                self.cache.put(partition, &request, response).await?;
                Ok::<_, CacheError>(true)
            }
        });

        let mut refreshed = 0;
        for (path, outcome) in self.config.critical_assets.iter().zip(join_all(refreshes).await) {
            match outcome {
                Ok(true) => refreshed += 1,
                Ok(false) => debug!(asset = %path, "critical asset not refreshed"),
                Err(err) => warn!(asset = %path, "failed to update asset: {}", err),
            }
        }
        info!(refreshed, "critical assets updated");
        refreshed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache_controller::storage::MemoryCacheStorage;
    use crate::testing::{FakeNetwork, eventually};

    const ORIGIN: &str = "https://app.tripbasket.test";

    fn url(path: &str) -> Url {
        Url::parse(ORIGIN).unwrap().join(path).unwrap()
    }

    fn setup(version: &str) -> (CacheController, Arc<MemoryCacheStorage>, Arc<FakeNetwork>) {
        let cache = Arc::new(MemoryCacheStorage::new());
        let network = Arc::new(FakeNetwork::default());
        let config = CacheConfig::tripbasket(Url::parse(ORIGIN).unwrap(), version);
        let controller = CacheController::new(config, cache.clone(), network.clone());
        (controller, cache, network)
    }

    async fn serve_manifest(controller: &CacheController, network: &FakeNetwork) {
        for path in &controller.config().critical_assets {
            network.respond(url(path), StatusCode::OK, format!("v1:{path}")).await;
        }
    }

    fn body(decision: FetchDecision) -> String {
        match decision {
            FetchDecision::Respond(Ok(resp)) => String::from_utf8(resp.body.to_vec()).unwrap(),
            other => panic!("unexpected decision {other:?}"),
        }
    }

    #[test]
    fn bundle_and_asset_patterns() {
        let cfg = CacheConfig::tripbasket(Url::parse(ORIGIN).unwrap(), "v1");
        assert!(cfg.is_bundle("/runtime.4f2a.js"));
        assert!(cfg.is_bundle("/static/vendor-99.js"));
        assert!(!cfg.is_bundle("/mainframe.js"));
        assert!(!cfg.is_bundle("/vendor.css"));
        assert!(cfg.is_asset(&url("/assets/fonts/Inter.woff2")));
        assert!(cfg.is_asset(&url("/icons/Icon-192.png")));
        assert!(cfg.is_asset(&url("/assets/images/optimized/a.webp")));
        assert!(!cfg.is_asset(&url("/api/trips")));
        assert!(cfg.is_critical("/"));
        assert_eq!(cfg.static_partition(), "tripbasket-static-v1");
    }

    #[tokio::test]
    async fn install_caches_manifest_with_reload() {
        let (controller, cache, network) = setup("v1");
        serve_manifest(&controller, &network).await;

        controller.install().await.unwrap();
        assert_eq!(controller.state(), WorkerState::Installed);
        assert_eq!(cache.len("tripbasket-static-v1").await, Some(7));
        assert!(network
            .calls()
            .await
            .iter()
            .all(|(_, mode)| *mode == CacheMode::Reload));
    }

    #[tokio::test]
    async fn install_fails_when_any_critical_asset_fails() {
        let (controller, cache, network) = setup("v1");
        serve_manifest(&controller, &network).await;
        network
            .respond(url("/main.dart.js"), StatusCode::NOT_FOUND, "missing")
            .await;

        let err = controller.install().await.unwrap_err();
        assert!(matches!(err, CacheError::Install { .. }));
        assert_eq!(controller.state(), WorkerState::Redundant);
        assert_eq!(cache.len("tripbasket-static-v1").await, Some(0));
    }

    #[tokio::test]
    async fn activate_removes_every_other_version() {
        let (old, cache, network) = setup("v1");
        serve_manifest(&old, &network).await;
        old.install().await.unwrap();
        cache.open("tripbasket-dynamic-v1").await.unwrap();
        cache.open("some-legacy-cache").await.unwrap();

        let new = CacheController::new(
            CacheConfig::tripbasket(Url::parse(ORIGIN).unwrap(), "v2"),
            cache.clone(),
            network.clone(),
        );
        new.install().await.unwrap();
        new.activate().await.unwrap();

        assert_eq!(new.state(), WorkerState::Activated);
        assert_eq!(cache.keys().await.unwrap(), vec!["tripbasket-static-v2"]);
    }

    #[tokio::test]
    async fn critical_hit_is_served_offline_and_revalidated_when_online() {
        let (controller, cache, network) = setup("v1");
        serve_manifest(&controller, &network).await;
        controller.install().await.unwrap();

        network.go_offline().await;
        let decision = controller.handle_fetch(FetchRequest::get(url("/main.dart.js"))).await;
        assert_eq!(body(decision), "v1:/main.dart.js");
        // wait for the offline revalidation attempt to settle
        let net = &network;
        assert!(eventually(|| async move { net.calls().await.len() == 8 }).await);

        network.go_online().await;
        network.respond(url("/main.dart.js"), StatusCode::OK, "v2").await;
        let decision = controller.handle_fetch(FetchRequest::get(url("/main.dart.js"))).await;
        assert_eq!(body(decision), "v1:/main.dart.js");

        let request = &FetchRequest::get(url("/main.dart.js"));
        let cache = &cache;
        let refreshed = eventually(|| async move {
            cache
                .match_in("tripbasket-static-v1", request)
                .await
                .unwrap()
                .is_some_and(|r| r.body == "v2")
        })
        .await;
        assert!(refreshed);
    }

    #[tokio::test]
    async fn non_get_and_foreign_requests_pass_through() {
        let (controller, _, _) = setup("v1");
        let mut post = FetchRequest::get(url("/api/book"));
        post.method = Method::POST;
        assert!(matches!(controller.handle_fetch(post).await, FetchDecision::Passthrough));

        let foreign = FetchRequest::get(Url::parse("https://firestore.googleapis.com/v1/x").unwrap());
        assert!(matches!(controller.handle_fetch(foreign).await, FetchDecision::Passthrough));
    }

    #[tokio::test]
    async fn cdn_requests_are_network_first_and_cached_as_assets() {
        let (controller, cache, network) = setup("v1");
        let font = Url::parse("https://fonts.gstatic.com/s/inter/v1/inter.woff2").unwrap();
        network.respond(font.clone(), StatusCode::OK, "font").await;

        let decision = controller.handle_fetch(FetchRequest::get(font.clone())).await;
        assert_eq!(body(decision), "font");
        let request = &FetchRequest::get(font);
        let cache = &cache;
        assert!(
            eventually(|| async move {
                cache
                    .match_in("tripbasket-dynamic-v1", request)
                    .await
                    .unwrap()
                    .is_some()
            })
            .await
        );
    }

    #[tokio::test]
    async fn asset_miss_is_fetched_and_stored_only_on_200() {
        let (controller, cache, network) = setup("v1");
        network
            .respond(url("/assets/fonts/a.woff2"), StatusCode::OK, "a")
            .await;
        network
            .respond(url("/assets/fonts/b.woff2"), StatusCode::NOT_FOUND, "")
            .await;

        controller.handle_fetch(FetchRequest::get(url("/assets/fonts/a.woff2"))).await;
        controller.handle_fetch(FetchRequest::get(url("/assets/fonts/b.woff2"))).await;
        assert_eq!(cache.len("tripbasket-dynamic-v1").await, Some(1));
    }

    #[tokio::test]
    async fn offline_script_miss_gets_synthetic_fallback() {
        let (controller, _, network) = setup("v1");
        network.go_offline().await;

        match controller.handle_fetch(FetchRequest::get(url("/js/widget.js"))).await {
            FetchDecision::Respond(Ok(resp)) => {
                assert_eq!(resp.status, StatusCode::OK);
                assert!(resp.body.is_empty());
            }
            other => panic!("unexpected {other:?}"),
        }
        match controller.handle_fetch(FetchRequest::get(url("/assets/fonts/x.woff2"))).await {
            FetchDecision::Respond(Err(CacheError::Network { .. })) => {}
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn network_first_falls_back_to_exact_cached_entry_or_fails() {
        let (controller, cache, network) = setup("v1");
        let page = FetchRequest::get(url("/trips/42"));
        cache
            .put(
                "tripbasket-dynamic-v1",
                &page,
                FetchResponse::new(StatusCode::OK, page.url.clone(), "cached trip"),
            )
            .await
            .unwrap();
        network.go_offline().await;

        assert_eq!(body(controller.handle_fetch(page).await), "cached trip");
        match controller.handle_fetch(FetchRequest::get(url("/trips/43"))).await {
            FetchDecision::Respond(Err(_)) => {}
            other => panic!("expected failure, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn root_navigation_gets_offline_page_when_nothing_is_cached() {
        let (controller, _, network) = setup("v1");
        network.go_offline().await;

        match controller.handle_fetch(FetchRequest::navigate(url("/"))).await {
            FetchDecision::Respond(Ok(resp)) => {
                assert_eq!(resp.status, StatusCode::SERVICE_UNAVAILABLE);
                assert!(String::from_utf8_lossy(&resp.body).contains("Offline"));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn refresh_critical_assets_overwrites_and_tolerates_failures() {
        let (controller, cache, network) = setup("v1");
        serve_manifest(&controller, &network).await;
        controller.install().await.unwrap();

        network.respond(url("/flutter.js"), StatusCode::OK, "fresh").await;
        network.fail(url("/manifest.json")).await;

        assert_eq!(controller.refresh_critical_assets().await, 6);
        let cached = cache
            .match_in("tripbasket-static-v1", &FetchRequest::get(url("/flutter.js")))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(cached.body, "fresh");
    }
}
