/// Transaction resolution for proposals
///
/// A proposal only carries transaction hashes. The resolver turns them into
/// bodies without blocking the caller: it answers from what is already
/// local and schedules background downloads for the rest. A tick that comes
/// up short fails with `MissingTransactions` and is retried once the
/// downloads land.

use crate::application::{Application, Transaction, TxLookup};
use crate::crypto::Hash;
use crate::error::{ConsensusError, Result};
use crate::objects::BlockHeader;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tokio::runtime::Handle;
use tokio::sync::Semaphore;
use tracing::{debug, warn, Instrument, Span};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TxResolverConfig {
    /// Deadline for a single peer request
    pub request_timeout: Duration,
    pub retry_delay: Duration,
    pub max_retries: u32,
    /// A hash requested longer ago than this may be requested again
    pub in_flight_expiry: Duration,
    pub max_concurrent_downloads: usize,
    /// Heights a cached transaction outlives the height it was seen at
    pub cache_height_window: u32,
}

impl Default for TxResolverConfig {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(4),
            retry_delay: Duration::from_secs(1),
            max_retries: 3,
            in_flight_expiry: Duration::from_secs(30),
            max_concurrent_downloads: 16,
            cache_height_window: 5,
        }
    }
}

/// Peer requests the resolver relies on
#[async_trait]
pub trait TxFetcher: Send + Sync {
    async fn request_pending_txs(&self, hashes: &[Hash]) -> anyhow::Result<Vec<Transaction>>;

    async fn request_mined_txs(&self, hashes: &[Hash]) -> anyhow::Result<Vec<Transaction>>;

    async fn request_block_header(&self, height: u32) -> anyhow::Result<Option<BlockHeader>>;
}

#[derive(Default)]
struct TxCache {
    txs: HashMap<Hash, (u32, Transaction)>,
    in_flight: HashMap<Hash, Instant>,
}

pub struct TxResolver {
    app: Arc<dyn Application>,
    fetcher: Arc<dyn TxFetcher>,
    config: TxResolverConfig,
    cache: Arc<Mutex<TxCache>>,
    downloads: Arc<Semaphore>,
    span: Span,
}

impl TxResolver {
    pub fn new(app: Arc<dyn Application>, fetcher: Arc<dyn TxFetcher>, config: TxResolverConfig) -> Self {
        let downloads = Arc::new(Semaphore::new(config.max_concurrent_downloads.max(1)));
        Self {
            app,
            fetcher,
            config,
            cache: Arc::new(Mutex::new(TxCache::default())),
            downloads,
            span: tracing::info_span!("tx_resolver"),
        }
    }

    fn cache(&self) -> Result<MutexGuard<'_, TxCache>> {
        lock(&self.cache)
    }

    /// Transactions for `hashes`, in request order, plus whatever is still
    /// missing. Missing hashes are scheduled for download.
    pub fn get_txs(&self, height: u32, round: u32, hashes: &[Hash]) -> Result<TxLookup> {
        let _enter = self.span.enter();
        let mut found: HashMap<Hash, Transaction> = HashMap::new();
        {
            let cache = self.cache()?;
            for hash in hashes {
                if let Some((_, tx)) = cache.txs.get(hash) {
                    found.insert(*hash, tx.clone());
                }
            }
        }

        let remaining = unresolved(hashes, &found);
        if !remaining.is_empty() {
            let (txs, _) = self.app.pending_tx_get(height, &remaining)?;
            found.extend(txs.into_iter().map(|tx| (tx.hash(), tx)));
        }
        let remaining = unresolved(hashes, &found);
        if !remaining.is_empty() {
            let (txs, _) = self.app.mined_tx_get(&remaining)?;
            found.extend(txs.into_iter().map(|tx| (tx.hash(), tx)));
        }

        let missing = unresolved(hashes, &found);
        if !missing.is_empty() {
            debug!(height, round, missing = missing.len(), "transactions not local");
            self.download(height, missing.clone())?;
        }
        let txs = hashes.iter().filter_map(|h| found.get(h).cloned()).collect();
        Ok((txs, missing))
    }

    /// Remember transactions learned out of band
    pub fn add_txs(&self, height: u32, txs: &[Transaction]) -> Result<()> {
        let mut cache = self.cache()?;
        for tx in txs {
            cache.txs.insert(tx.hash(), (height, tx.clone()));
        }
        Ok(())
    }

    /// Start fetching `hashes` from peers unless already being fetched
    pub fn download(&self, height: u32, hashes: Vec<Hash>) -> Result<()> {
        let Ok(handle) = Handle::try_current() else {
            debug!(count = hashes.len(), "no runtime, skipping transaction download");
            return Ok(());
        };
        let wanted: Vec<Hash> = {
            let mut cache = self.cache()?;
            let now = Instant::now();
            let expiry = self.config.in_flight_expiry;
            cache
                .in_flight
                .retain(|_, started| now.duration_since(*started) < expiry);
            let wanted: Vec<Hash> = hashes
                .into_iter()
                .filter(|h| !cache.txs.contains_key(h) && !cache.in_flight.contains_key(h))
                .collect();
            for hash in &wanted {
                cache.in_flight.insert(*hash, now);
            }
            wanted
        };
        if wanted.is_empty() {
            return Ok(());
        }

        let task = Download {
            fetcher: Arc::clone(&self.fetcher),
            cache: Arc::clone(&self.cache),
            downloads: Arc::clone(&self.downloads),
            config: self.config.clone(),
            height,
        };
        handle.spawn(task.run(wanted).instrument(self.span.clone()));
        Ok(())
    }

    /// Drop cached transactions seen more than the configured window
    /// below `height`
    pub fn clean_cache(&self, height: u32) -> Result<()> {
        let window = self.config.cache_height_window;
        let mut cache = self.cache()?;
        cache
            .txs
            .retain(|_, (seen, _)| seen.saturating_add(window) >= height);
        Ok(())
    }

    pub fn in_flight(&self) -> Result<usize> {
        Ok(self.cache()?.in_flight.len())
    }

    pub fn cached(&self) -> Result<usize> {
        Ok(self.cache()?.txs.len())
    }

    /// Committed header at `height` from a peer
    pub async fn fetch_block_header(&self, height: u32) -> anyhow::Result<Option<BlockHeader>> {
        let request = self.fetcher.request_block_header(height);
        match tokio::time::timeout(self.config.request_timeout, request).await {
            Ok(result) => result,
            Err(_) => anyhow::bail!("block header request for height {height} timed out"),
        }
    }
}

struct Download {
    fetcher: Arc<dyn TxFetcher>,
    cache: Arc<Mutex<TxCache>>,
    downloads: Arc<Semaphore>,
    config: TxResolverConfig,
    height: u32,
}

impl Download {
    async fn run(self, hashes: Vec<Hash>) {
        let Ok(_permit) = self.downloads.acquire().await else {
            return;
        };
        let mut remaining: HashSet<Hash> = hashes.iter().copied().collect();
        for attempt in 0..=self.config.max_retries {
            if attempt > 0 {
                tokio::time::sleep(self.config.retry_delay).await;
            }
            let wanted: Vec<Hash> = remaining.iter().copied().collect();
            let mut got = self.request(self.fetcher.request_pending_txs(&wanted)).await;
            let still: Vec<Hash> = wanted
                .iter()
                .filter(|h| !got.iter().any(|tx| &tx.hash() == *h))
                .copied()
                .collect();
            if !still.is_empty() {
                got.extend(self.request(self.fetcher.request_mined_txs(&still)).await);
            }
            let stored = self.store(&mut remaining, got);
            if remaining.is_empty() {
                debug!(height = self.height, stored, attempt, "transactions resolved");
                break;
            }
        }
        if !remaining.is_empty() {
            warn!(height = self.height, missing = remaining.len(), "giving up on transactions");
        }
        if let Ok(mut cache) = lock(&self.cache) {
            for hash in &hashes {
                cache.in_flight.remove(hash);
            }
        }
    }

    async fn request<F>(&self, request: F) -> Vec<Transaction>
    where
        F: std::future::Future<Output = anyhow::Result<Vec<Transaction>>>,
    {
        match tokio::time::timeout(self.config.request_timeout, request).await {
            Ok(Ok(txs)) => txs,
            Ok(Err(e)) => {
                debug!(error = %e, "transaction request failed");
                Vec::new()
            }
            Err(_) => {
                debug!("transaction request timed out");
                Vec::new()
            }
        }
    }

    /// Cache the transactions that were asked for; returns how many
    fn store(&self, remaining: &mut HashSet<Hash>, txs: Vec<Transaction>) -> usize {
        let Ok(mut cache) = lock(&self.cache) else {
            return 0;
        };
        let mut stored = 0;
        for tx in txs {
            let hash = tx.hash();
            if remaining.remove(&hash) {
                cache.txs.insert(hash, (self.height, tx));
                stored += 1;
            }
        }
        stored
    }
}

fn lock(cache: &Mutex<TxCache>) -> Result<MutexGuard<'_, TxCache>> {
    cache
        .lock()
        .map_err(|_| ConsensusError::Application("transaction cache lock poisoned".into()))
}

fn unresolved(hashes: &[Hash], found: &HashMap<Hash, Transaction>) -> Vec<Hash> {
    hashes.iter().filter(|h| !found.contains_key(h)).copied().collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::MockApplication;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct PeerStore {
        txs: Vec<Transaction>,
        failures_left: AtomicUsize,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl TxFetcher for PeerStore {
        async fn request_pending_txs(&self, hashes: &[Hash]) -> anyhow::Result<Vec<Transaction>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self
                .failures_left
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                anyhow::bail!("peer unavailable");
            }
            Ok(self
                .txs
                .iter()
                .filter(|tx| hashes.contains(&tx.hash()))
                .cloned()
                .collect())
        }

        async fn request_mined_txs(&self, _hashes: &[Hash]) -> anyhow::Result<Vec<Transaction>> {
            Ok(Vec::new())
        }

        async fn request_block_header(&self, _height: u32) -> anyhow::Result<Option<BlockHeader>> {
            Ok(None)
        }
    }

    fn fast_config() -> TxResolverConfig {
        TxResolverConfig {
            request_timeout: Duration::from_millis(200),
            retry_delay: Duration::from_millis(5),
            ..TxResolverConfig::default()
        }
    }

    async fn settle(resolver: &TxResolver) {
        for _ in 0..200 {
            if resolver.in_flight().unwrap() == 0 {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("downloads never settled");
    }

    #[tokio::test]
    async fn test_local_sources_answer_first() {
        let app = Arc::new(MockApplication::new(Hash::zero()));
        let pending = Transaction::new(b"pending".to_vec());
        app.pending_tx_add(&[pending.clone()]).unwrap();
        let peers = Arc::new(PeerStore::default());
        let resolver = TxResolver::new(app, peers.clone(), fast_config());

        let cached = Transaction::new(b"cached".to_vec());
        resolver.add_txs(2, &[cached.clone()]).unwrap();

        let (txs, missing) = resolver
            .get_txs(2, 1, &[cached.hash(), pending.hash()])
            .unwrap();
        assert_eq!(txs, vec![cached, pending]);
        assert!(missing.is_empty());
        assert_eq!(peers.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_missing_transactions_are_downloaded() {
        let remote = Transaction::new(b"remote".to_vec());
        let peers = Arc::new(PeerStore {
            txs: vec![remote.clone()],
            ..PeerStore::default()
        });
        let app = Arc::new(MockApplication::new(Hash::zero()));
        let resolver = TxResolver::new(app, peers, fast_config());

        let (txs, missing) = resolver.get_txs(2, 1, &[remote.hash()]).unwrap();
        assert!(txs.is_empty());
        assert_eq!(missing, vec![remote.hash()]);

        settle(&resolver).await;
        let (txs, missing) = resolver.get_txs(2, 1, &[remote.hash()]).unwrap();
        assert_eq!(txs, vec![remote]);
        assert!(missing.is_empty());
    }

    #[tokio::test]
    async fn test_in_flight_requests_are_deduplicated() {
        let remote = Transaction::new(b"remote".to_vec());
        let peers = Arc::new(PeerStore {
            txs: vec![remote.clone()],
            ..PeerStore::default()
        });
        let app = Arc::new(MockApplication::new(Hash::zero()));
        let resolver = TxResolver::new(app, peers.clone(), fast_config());

        resolver.download(2, vec![remote.hash()]).unwrap();
        resolver.download(2, vec![remote.hash()]).unwrap();
        settle(&resolver).await;
        assert_eq!(peers.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_download_retries_after_failure() {
        let remote = Transaction::new(b"remote".to_vec());
        let peers = Arc::new(PeerStore {
            txs: vec![remote.clone()],
            failures_left: AtomicUsize::new(2),
            ..PeerStore::default()
        });
        let app = Arc::new(MockApplication::new(Hash::zero()));
        let resolver = TxResolver::new(app, peers.clone(), fast_config());

        resolver.download(2, vec![remote.hash()]).unwrap();
        settle(&resolver).await;
        assert_eq!(peers.calls.load(Ordering::SeqCst), 3);
        assert_eq!(resolver.cached().unwrap(), 1);
    }

    #[test]
    fn test_clean_cache_drops_old_heights() {
        let app = Arc::new(MockApplication::new(Hash::zero()));
        let resolver = TxResolver::new(app, Arc::new(PeerStore::default()), TxResolverConfig::default());
        resolver.add_txs(2, &[Transaction::new(b"old".to_vec())]).unwrap();
        resolver.add_txs(9, &[Transaction::new(b"new".to_vec())]).unwrap();
        resolver.clean_cache(10).unwrap();
        assert_eq!(resolver.cached().unwrap(), 1);
    }

    #[test]
    fn test_without_runtime_nothing_is_scheduled() {
        let app = Arc::new(MockApplication::new(Hash::zero()));
        let resolver = TxResolver::new(app, Arc::new(PeerStore::default()), TxResolverConfig::default());
        let (_, missing) = resolver.get_txs(2, 1, &[Hash::new([5; 32])]).unwrap();
        assert_eq!(missing.len(), 1);
    }
}
