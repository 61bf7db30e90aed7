use std::collections::VecDeque;

use modlocale_core::{codec::EncodedPayload, ids::LanguageFileId};
use modlocale_engine::{BatchOutcome, EngineConfig, MergeStrategy};

use crate::TestPeer;

/// Peers sharing one language file, connected by in-memory inboxes.
pub struct TestNetwork {
    language_file: LanguageFileId,
    config: EngineConfig,
    peers: Vec<TestPeer>,
    inboxes: Vec<VecDeque<EncodedPayload>>,
}

impl Default for TestNetwork {
    fn default() -> Self {
        Self::new()
    }
}

impl TestNetwork {
    pub fn new() -> Self {
        Self::with_config(EngineConfig::default())
    }

    pub fn with_config(config: EngineConfig) -> Self {
        Self {
            language_file: LanguageFileId::new(),
            config,
            peers: Vec::new(),
            inboxes: Vec::new(),
        }
    }

    pub fn language_file(&self) -> LanguageFileId {
        self.language_file
    }

    pub fn add_peer(&mut self) -> Result<usize, Box<dyn std::error::Error>> {
        let peer = TestPeer::with_config(self.language_file, self.config.clone())?;
        let index = self.peers.len();
        self.peers.push(peer);
        self.inboxes.push(VecDeque::new());
        Ok(index)
    }

    pub fn peer(&self, index: usize) -> &TestPeer {
        &self.peers[index]
    }

    pub fn peer_mut(&mut self, index: usize) -> &mut TestPeer {
        &mut self.peers[index]
    }

    pub fn inbox_mut(&mut self, index: usize) -> &mut VecDeque<EncodedPayload> {
        &mut self.inboxes[index]
    }

    /// Export `from`'s local changes into `to`'s inbox and record them as
    /// synced on `from`. Returns the number of payloads queued.
    pub fn send(&mut self, from: usize, to: usize) -> Result<usize, Box<dyn std::error::Error>> {
        let (changes, payloads) = self.peers[from].engine.export_changes()?;
        let count = payloads.len();
        self.inboxes[to].extend(payloads);
        self.peers[from].engine.mark_synced(&changes)?;
        Ok(count)
    }

    /// Merge everything waiting in `to`'s inbox.
    pub fn deliver(&mut self, to: usize, strategy: &MergeStrategy) -> Result<BatchOutcome, Box<dyn std::error::Error>> {
        let payloads: Vec<EncodedPayload> = self.inboxes[to].drain(..).collect();
        if payloads.is_empty() {
            return Ok(BatchOutcome::default());
        }
        Ok(self.peers[to].engine.import_changes(&payloads, strategy)?)
    }

    /// One full exchange: `a` to `b`, then `b` to `a`.
    pub fn sync(
        &mut self,
        a: usize,
        b: usize,
        strategy: &MergeStrategy,
    ) -> Result<(BatchOutcome, BatchOutcome), Box<dyn std::error::Error>> {
        self.send(a, b)?;
        let at_b = self.deliver(b, strategy)?;
        self.send(b, a)?;
        let at_a = self.deliver(a, strategy)?;
        Ok((at_b, at_a))
    }
}
