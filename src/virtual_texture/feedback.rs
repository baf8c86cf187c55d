use std::sync::Arc;
use crossbeam_channel::{bounded, Receiver};
use rayon::prelude::*;
use crate::constants::feedback;
use crate::error::{VtError, VtResult};
use super::page::{ImageId, PageRequest};
use super::registry::VirtualImage;
use super::request_list::RequestList;

/// Raw value of a feedback texel nothing was rendered to
pub const UNWRITTEN_SAMPLE: i32 = 0;

/// Decoded feedback texel: absolute indirection coordinates and requested mip
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FeedbackSample {
    pub x: u32,
    pub y: u32,
    pub mip: u32,
}

impl FeedbackSample {
    pub fn new(x: u32, y: u32, mip: u32) -> Self {
        Self { x, y, mip }
    }

    /// Pack into the layout the feedback shader writes
    pub fn encode(self) -> i32 {
        let coord_mask = feedback::COORD_MASK as u32;
        let mip_field = (self.mip as i32 + feedback::MIP_BIAS) as u32 & feedback::MIP_MASK as u32;

        (feedback::WRITTEN_FLAG
            | ((self.x & coord_mask) << feedback::X_SHIFT)
            | ((self.y & coord_mask) << feedback::Y_SHIFT)
            | (mip_field << feedback::MIP_SHIFT)) as i32
    }

    /// `None` for texels not written this frame
    pub fn decode(raw: i32) -> Option<Self> {
        // Written flag is the sign bit
        if raw >= 0 {
            return None;
        }

        let mip_field = (raw >> feedback::MIP_SHIFT) & feedback::MIP_MASK;
        if mip_field == 0 {
            return None;
        }

        Some(Self {
            x: ((raw >> feedback::X_SHIFT) & feedback::COORD_MASK) as u32,
            y: ((raw >> feedback::Y_SHIFT) & feedback::COORD_MASK) as u32,
            mip: (mip_field - feedback::MIP_BIAS) as u32,
        })
    }
}

/// Finds the live image containing a texel.
///
/// Neighbouring texels usually share an image, so the search starts at the
/// last hit and walks down, then up. Images whose regions interleave at the
/// texel level get no guarantee beyond what a linear scan in that order finds.
struct ImageLocator<'a> {
    images: &'a [VirtualImage],
    end: usize,
    last_hit: Option<usize>,
}

impl<'a> ImageLocator<'a> {
    fn new(images: &'a [VirtualImage]) -> Self {
        let end = images.iter().rposition(VirtualImage::is_live).map_or(0, |i| i + 1);
        Self { images, end, last_hit: None }
    }

    fn find(&mut self, x: u32, y: u32) -> Option<ImageId> {
        let images = self.images;
        let hit = |&id: &usize| images[id].is_live() && images[id].contains(x, y);

        let found = match self.last_hit {
            None => (0..self.end).find(hit),
            Some(last) => (0..=last).rev().find(hit).or_else(|| (last + 1..self.end).find(hit)),
        };

        if found.is_some() {
            self.last_hit = found;
        }
        found
    }
}

/// Turn a range of raw feedback samples into weighted page requests.
///
/// Each resolved sample requests its page and, below the image's coarsest
/// mip, the next coarser page too so trilinear filtering has both levels.
pub fn analyze_range(samples: &[i32], images: &[VirtualImage], out: &mut RequestList) {
    let mut locator = ImageLocator::new(images);
    let mut unresolved = 0usize;

    for &raw in samples {
        let Some(sample) = FeedbackSample::decode(raw) else {
            continue;
        };

        let Some(owner) = locator.find(sample.x, sample.y) else {
            unresolved += 1;
            continue;
        };

        let max_mip = images[owner].max_mip();
        let mip = sample.mip.min(max_mip);
        out.add(PageRequest::new(sample.x >> mip, sample.y >> mip, mip, owner), 1);

        if mip < max_mip {
            let coarser = mip + 1;
            out.add(PageRequest::new(sample.x >> coarser, sample.y >> coarser, coarser, owner), 1);
        }
    }

    if unresolved > 0 {
        log::trace!("[analyze_range] {} samples had no owning image", unresolved);
    }
}

/// Split `samples` into `workers` equal shards, analyse them in parallel and
/// merge the per-shard lists in shard order
pub fn analyze_parallel(samples: &[i32], images: &[VirtualImage], workers: usize) -> RequestList {
    let shard_len = samples.len().div_ceil(workers.max(1)).max(1);

    let shards: Vec<RequestList> = samples
        .par_chunks(shard_len)
        .map(|shard| {
            let mut list = RequestList::with_capacity(256);
            analyze_range(shard, images, &mut list);
            list
        })
        .collect();

    let mut merged = RequestList::with_capacity(shards.iter().map(RequestList::len).max().unwrap_or(0));
    for shard in &shards {
        merged.merge(shard);
    }
    merged
}

/// Handle to an in-flight feedback analysis
#[derive(Debug)]
pub struct AnalysisTask {
    receiver: Receiver<RequestList>,
}

impl AnalysisTask {
    /// A task that already finished with `requests`
    pub fn completed(requests: RequestList) -> Self {
        let (sender, receiver) = bounded(1);
        let _ = sender.send(requests);
        Self { receiver }
    }

    pub fn is_ready(&self) -> bool {
        !self.receiver.is_empty()
    }

    /// Block until the merged request list is available
    pub fn wait(self) -> VtResult<RequestList> {
        self.receiver.recv().map_err(|_| VtError::AnalysisDisconnected)
    }
}

/// Runs feedback analysis on a dedicated thread pool
#[derive(Clone)]
pub struct FeedbackAnalyzer {
    pool: Arc<rayon::ThreadPool>,
    workers: usize,
}

impl FeedbackAnalyzer {
    pub fn new(workers: usize) -> VtResult<Self> {
        let workers = workers.max(1);
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(workers)
            .thread_name(|idx| format!("vt-feedback-{}", idx))
            .panic_handler(|_| log::error!("[FeedbackAnalyzer] Analysis worker panicked"))
            .build()?;

        log::info!("[FeedbackAnalyzer::new] {} analysis workers", workers);
        Ok(Self {
            pool: Arc::new(pool),
            workers,
        })
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    /// Start analysing `samples` against a snapshot of the image table
    pub fn schedule(&self, samples: Arc<[i32]>, images: Arc<[VirtualImage]>) -> AnalysisTask {
        let (sender, receiver) = bounded(1);
        let workers = self.workers;

        // Runs inside the pool, so the shards below use its threads
        self.pool.spawn(move || {
            let requests = analyze_parallel(&samples, &images, workers);
            let _ = sender.send(requests);
        });

        AnalysisTask { receiver }
    }
}

impl std::fmt::Debug for FeedbackAnalyzer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FeedbackAnalyzer").field("workers", &self.workers).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use glam::Vec2;

    fn image(x: u16, y: u16, size: u16) -> VirtualImage {
        VirtualImage {
            alloc_id: Some(0),
            x,
            y,
            size,
            mip_count: (size.ilog2() + 1) as u8,
            uv_origin: Vec2::ZERO,
            uv_size: 0.0,
            derivative_scale: 0.0,
        }
    }

    #[test]
    fn test_sample_layout() {
        let raw = FeedbackSample::new(0xABC, 0x123, 2).encode();
        assert!(raw < 0);
        assert_eq!(raw as u32, 0x8312_3ABC);
        assert_eq!(FeedbackSample::decode(raw), Some(FeedbackSample::new(0xABC, 0x123, 2)));
    }

    #[test]
    fn test_unwritten_samples_are_skipped() {
        assert_eq!(FeedbackSample::decode(UNWRITTEN_SAMPLE), None);
        assert_eq!(FeedbackSample::decode(0x0100_0001), None);
        // Written flag with a zero mip field
        assert_eq!(FeedbackSample::decode(i32::MIN | 5), None);
    }

    #[test]
    fn test_requests_self_and_coarser_mip() {
        let images = [image(0, 0, 8)];
        let mut out = RequestList::default();
        analyze_range(&[FeedbackSample::new(5, 6, 1).encode()], &images, &mut out);

        let requests: Vec<PageRequest> = out.iter().map(|(r, _)| r).collect();
        assert_eq!(requests, vec![PageRequest::new(2, 3, 1, 0), PageRequest::new(1, 1, 2, 0)]);
    }

    #[test]
    fn test_mip_is_clamped_to_coarsest() {
        let images = [image(8, 0, 4)];
        let mut out = RequestList::default();
        analyze_range(&[FeedbackSample::new(9, 1, 9).encode()], &images, &mut out);

        assert_eq!(out.len(), 1);
        assert_eq!(out.get(0).unwrap().0, PageRequest::new(9 >> 2, 0, 2, 0));
    }

    #[test]
    fn test_owner_search_both_directions() {
        let mut images = vec![image(0, 0, 8), VirtualImage::default(), image(8, 0, 8), image(16, 0, 8)];
        images[0].alloc_id = Some(1);

        let samples = [
            FeedbackSample::new(17, 0, 0).encode(),
            FeedbackSample::new(1, 1, 0).encode(),
            FeedbackSample::new(9, 1, 0).encode(),
            FeedbackSample::new(40, 40, 0).encode(),
        ];
        let mut out = RequestList::default();
        analyze_range(&samples, &images, &mut out);

        let owners: Vec<ImageId> = out.iter().map(|(r, _)| r.owner).step_by(2).collect();
        assert_eq!(owners, vec![3, 0, 2]);
    }

    #[test]
    fn test_repeats_accumulate() {
        let images = [image(0, 0, 1)];
        let samples = vec![FeedbackSample::new(0, 0, 0).encode(); 10];
        let mut out = RequestList::default();
        analyze_range(&samples, &images, &mut out);

        assert_eq!(out.len(), 1);
        assert_eq!(out.get(0).unwrap().1, 10);
    }

    #[test]
    fn test_parallel_matches_serial() {
        let images = [image(0, 0, 16), image(16, 0, 16)];
        let samples: Vec<i32> = (0..1000u32)
            .map(|i| FeedbackSample::new(i % 32, (i / 32) % 16, i % 3).encode())
            .collect();

        let mut serial = RequestList::default();
        analyze_range(&samples, &images, &mut serial);
        let parallel = analyze_parallel(&samples, &images, 4);

        assert_eq!(serial.len(), parallel.len());
        for (request, count) in serial.iter() {
            assert_eq!(parallel.count_of(&request), Some(count));
        }
    }

    #[test]
    fn test_scheduled_task_delivers() {
        let analyzer = FeedbackAnalyzer::new(2).unwrap();
        let images: Arc<[VirtualImage]> = vec![image(0, 0, 4)].into();
        let samples: Arc<[i32]> = vec![FeedbackSample::new(1, 1, 0).encode(); 64].into();

        let requests = analyzer.schedule(samples, images).wait().unwrap();
        assert_eq!(requests.len(), 2);
        assert_eq!(requests.get(0).unwrap().1, 64);
    }

    #[test]
    fn test_dropped_task_reports_disconnect() {
        let (sender, receiver) = bounded::<RequestList>(1);
        drop(sender);
        let task = AnalysisTask { receiver };
        assert!(matches!(task.wait(), Err(VtError::AnalysisDisconnected)));
    }
}
