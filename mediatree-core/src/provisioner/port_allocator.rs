//! Host port leasing for the docker provisioner
//!
//! Four disjoint ranges, each with a cursor that only moves forward. Released
//! ports are cleared from the used set but the cursor is never rewound, so a
//! port is not handed out twice until [`PortAllocator::reset`].

use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashSet;
use tracing::warn;

use crate::config::{DockerConfig, PortRangeConfig};
use crate::models::PortRange;
use crate::{Error, Result};

#[derive(Debug, Clone)]
struct Lane {
    name: &'static str,
    min: u16,
    max: u16,
    /// Next candidate port; u32 so it can step past `u16::MAX`
    cursor: u32,
}

impl Lane {
    fn new(name: &'static str, range: PortRangeConfig) -> Self {
        Self {
            name,
            min: range.start,
            max: range.end,
            cursor: u32::from(range.start),
        }
    }

    fn rewind(&mut self) {
        self.cursor = u32::from(self.min);
    }

    fn remaining(&self, used: &HashSet<u16>) -> usize {
        (self.cursor..=u32::from(self.max))
            .filter_map(|p| u16::try_from(p).ok())
            .filter(|p| !used.contains(p))
            .count()
    }
}

#[derive(Debug)]
struct Inner {
    api: Lane,
    media_http: Lane,
    media_ws: Lane,
    webrtc: Lane,
    block_size: u16,
    used: HashSet<u16>,
}

impl Inner {
    /// Take the next free port at or after the cursor
    fn take(lane: &mut Lane, used: &mut HashSet<u16>) -> Result<u16> {
        let max = u32::from(lane.max);
        while lane.cursor <= max {
            let candidate = u16::try_from(lane.cursor)
                .map_err(|_| Error::PortExhaustion(format!("{} ports exhausted", lane.name)))?;
            lane.cursor += 1;
            if used.insert(candidate) {
                return Ok(candidate);
            }
        }
        Err(Error::PortExhaustion(format!(
            "{} ports exhausted ({}-{})",
            lane.name, lane.min, lane.max
        )))
    }
}

/// Remaining capacity per range
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PortAllocatorStats {
    pub used_ports: usize,
    pub api_ports_available: usize,
    /// Complete HTTP + WS pairs that can still be leased
    pub media_pairs_available: usize,
    pub webrtc_blocks_available: usize,
}

#[derive(Debug)]
pub struct PortAllocator {
    inner: Mutex<Inner>,
}

impl PortAllocator {
    #[must_use]
    pub fn new(
        api: PortRangeConfig,
        media_http: PortRangeConfig,
        media_ws: PortRangeConfig,
        webrtc: PortRangeConfig,
        block_size: u16,
    ) -> Self {
        Self {
            inner: Mutex::new(Inner {
                api: Lane::new("api", api),
                media_http: Lane::new("media-http", media_http),
                media_ws: Lane::new("media-ws", media_ws),
                webrtc: Lane::new("webrtc", webrtc),
                block_size: block_size.max(1),
                used: HashSet::new(),
            }),
        }
    }

    #[must_use]
    pub fn from_config(config: &DockerConfig) -> Self {
        Self::new(
            config.api_ports,
            config.media_http_ports,
            config.media_ws_ports,
            config.webrtc_ports,
            config.webrtc_block_size,
        )
    }

    pub fn allocate_api(&self) -> Result<u16> {
        let mut inner = self.inner.lock();
        let Inner { api, used, .. } = &mut *inner;
        Inner::take(api, used)
    }

    /// Lease a media server HTTP port and WS port together
    pub fn allocate_media_pair(&self) -> Result<(u16, u16)> {
        let mut inner = self.inner.lock();
        let Inner {
            media_http,
            media_ws,
            used,
            ..
        } = &mut *inner;

        let http = Inner::take(media_http, used)?;
        match Inner::take(media_ws, used) {
            Ok(ws) => Ok((http, ws)),
            Err(e) => {
                used.remove(&http);
                Err(e)
            }
        }
    }

    /// Lease the next contiguous WebRTC block `[start, start + size - 1]`
    pub fn allocate_block(&self) -> Result<PortRange> {
        let mut inner = self.inner.lock();
        let size = u32::from(inner.block_size);
        let Inner { webrtc, used, .. } = &mut *inner;

        loop {
            let start = webrtc.cursor;
            let end = start + size - 1;
            if end > u32::from(webrtc.max) {
                return Err(Error::PortExhaustion(format!(
                    "webrtc ports exhausted: block {start}-{end} exceeds {}",
                    webrtc.max
                )));
            }
            webrtc.cursor = end + 1;

            let (Ok(start), Ok(end)) = (u16::try_from(start), u16::try_from(end)) else {
                continue;
            };
            if (start..=end).any(|p| used.contains(&p)) {
                continue;
            }
            used.extend(start..=end);
            return Ok(PortRange { start, end });
        }
    }

    /// Return a single port. `false` when the port was not leased.
    pub fn release(&self, port: u16) -> bool {
        let released = self.inner.lock().used.remove(&port);
        if !released {
            warn!(port, "Released a port that was not allocated");
        }
        released
    }

    /// Return every port of a block. `false` when any of them was not leased.
    pub fn release_range(&self, range: PortRange) -> bool {
        let mut inner = self.inner.lock();
        let mut balanced = true;
        for port in range.start..=range.end {
            balanced &= inner.used.remove(&port);
        }
        drop(inner);

        if !balanced {
            warn!(range = %range, "Released a port range that was not fully allocated");
        }
        balanced
    }

    #[must_use]
    pub fn is_used(&self, port: u16) -> bool {
        self.inner.lock().used.contains(&port)
    }

    /// Forget every lease and rewind all cursors
    pub fn reset(&self) {
        let mut inner = self.inner.lock();
        inner.used.clear();
        inner.api.rewind();
        inner.media_http.rewind();
        inner.media_ws.rewind();
        inner.webrtc.rewind();
    }

    #[must_use]
    pub fn stats(&self) -> PortAllocatorStats {
        let inner = self.inner.lock();
        let webrtc_left =
            (u32::from(inner.webrtc.max) + 1).saturating_sub(inner.webrtc.cursor) as usize;

        PortAllocatorStats {
            used_ports: inner.used.len(),
            api_ports_available: inner.api.remaining(&inner.used),
            media_pairs_available: inner
                .media_http
                .remaining(&inner.used)
                .min(inner.media_ws.remaining(&inner.used)),
            webrtc_blocks_available: webrtc_left / usize::from(inner.block_size),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn allocator() -> PortAllocator {
        PortAllocator::new(
            PortRangeConfig::new(7070, 7072),
            PortRangeConfig::new(8088, 8089),
            PortRangeConfig::new(8188, 8189),
            PortRangeConfig::new(20000, 20199),
            100,
        )
    }

    #[test]
    fn test_webrtc_block_boundary() {
        let ports = allocator();
        assert_eq!(
            ports.allocate_block().unwrap(),
            PortRange { start: 20000, end: 20099 }
        );
        // Cursor now sits at max - size + 1
        assert_eq!(
            ports.allocate_block().unwrap(),
            PortRange { start: 20100, end: 20199 }
        );
        assert!(matches!(
            ports.allocate_block(),
            Err(Error::PortExhaustion(_))
        ));
    }

    #[test]
    fn test_cursor_never_rewinds_on_release() {
        let ports = allocator();
        let first = ports.allocate_api().unwrap();
        assert_eq!(first, 7070);
        assert!(ports.release(first));

        assert_eq!(ports.allocate_api().unwrap(), 7071);
        assert_eq!(ports.allocate_api().unwrap(), 7072);
        assert!(ports.allocate_api().is_err());

        ports.reset();
        assert_eq!(ports.allocate_api().unwrap(), 7070);
    }

    #[test]
    fn test_allocations_never_overlap() {
        let ports = PortAllocator::new(
            PortRangeConfig::new(7070, 7100),
            PortRangeConfig::new(8088, 8120),
            PortRangeConfig::new(8188, 8220),
            PortRangeConfig::new(20000, 25000),
            100,
        );
        let mut seen = HashSet::new();
        for _ in 0..20 {
            assert!(seen.insert(ports.allocate_api().unwrap()));
            let (http, ws) = ports.allocate_media_pair().unwrap();
            assert!(seen.insert(http));
            assert!(seen.insert(ws));
            let block = ports.allocate_block().unwrap();
            for port in block.start..=block.end {
                assert!(seen.insert(port));
            }
        }
        assert_eq!(ports.stats().used_ports, seen.len());
    }

    #[test]
    fn test_unbalanced_release_is_reported() {
        let ports = allocator();
        assert!(!ports.release(7070));

        let block = ports.allocate_block().unwrap();
        assert!(ports.release_range(block));
        assert!(!ports.release_range(block));
        assert!(!ports.is_used(block.start));
    }

    #[test]
    fn test_media_pair_rolls_back_http_port() {
        let ports = PortAllocator::new(
            PortRangeConfig::new(7070, 7072),
            PortRangeConfig::new(8088, 8090),
            PortRangeConfig::new(8188, 8188),
            PortRangeConfig::new(20000, 20199),
            100,
        );
        assert_eq!(ports.allocate_media_pair().unwrap(), (8088, 8188));
        assert!(ports.allocate_media_pair().is_err());
        assert!(!ports.is_used(8089));
    }

    #[test]
    fn test_stats() {
        let ports = allocator();
        ports.allocate_api().unwrap();
        ports.allocate_media_pair().unwrap();
        ports.allocate_block().unwrap();

        let stats = ports.stats();
        assert_eq!(stats.used_ports, 103);
        assert_eq!(stats.api_ports_available, 2);
        assert_eq!(stats.media_pairs_available, 1);
        assert_eq!(stats.webrtc_blocks_available, 1);
    }
}
