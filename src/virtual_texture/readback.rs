use std::sync::Arc;
use bytemuck::{Pod, Zeroable};
use flume::{Receiver, Sender};
use glam::UVec2;
use crate::constants::feedback;
use super::feedback::UNWRITTEN_SAMPLE;

/// Constant block bound while rendering the feedback target.
///
/// Padded to 32 bytes; smaller blocks are not bound by some drivers.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct FeedbackUniforms {
    pub size: [u32; 2],
    /// Frame number masked for the shader's dither pattern
    pub frame: u32,
    pub _padding0: u32,
    pub _padding1: [u32; 4],
}

/// A finished GPU readback of the feedback target
#[derive(Debug, Clone)]
pub struct ReadbackCompletion {
    /// Frame the readback was issued on
    pub frame: u32,
    pub samples: Vec<i32>,
}

/// CPU copy of the feedback target, fed by asynchronous readbacks
#[derive(Debug)]
pub struct FeedbackReadback {
    downscale_shift: u32,
    size: UVec2,
    latest: Arc<[i32]>,
    latest_issue_frame: Option<u32>,
    last_update_frame: Option<u32>,
    sender: Sender<ReadbackCompletion>,
    receiver: Receiver<ReadbackCompletion>,
}

impl FeedbackReadback {
    pub fn new(downscale_shift: u32) -> Self {
        let (sender, receiver) = flume::unbounded();
        Self {
            downscale_shift,
            size: UVec2::ZERO,
            latest: Arc::from(Vec::new()),
            latest_issue_frame: None,
            last_update_frame: None,
            sender,
            receiver,
        }
    }

    /// Feedback target size in texels
    pub fn size(&self) -> UVec2 {
        self.size
    }

    /// Frame on which the CPU copy last changed
    pub fn last_update_frame(&self) -> Option<u32> {
        self.last_update_frame
    }

    /// Match the feedback target to the screen. Returns true when it was
    /// recreated, which resets the CPU copy to unwritten samples.
    pub fn refresh(&mut self, screen_width: u32, screen_height: u32) -> bool {
        let size = UVec2::new(
            (screen_width >> self.downscale_shift).max(1),
            (screen_height >> self.downscale_shift).max(1),
        );
        if size == self.size {
            return false;
        }

        log::debug!("[FeedbackReadback::refresh] Feedback target {}x{} -> {}x{}",
                    self.size.x, self.size.y, size.x, size.y);

        self.size = size;
        self.latest = vec![UNWRITTEN_SAMPLE; (size.x * size.y) as usize].into();
        self.latest_issue_frame = None;
        true
    }

    /// Handed to the renderer's readback callback
    pub fn completion_sender(&self) -> Sender<ReadbackCompletion> {
        self.sender.clone()
    }

    /// Take in finished readbacks without blocking. Completions whose length
    /// no longer matches the target are stale and dropped. Returns true when
    /// the CPU copy changed.
    pub fn poll(&mut self, frame: u32) -> bool {
        let expected = self.latest.len();
        let mut newest: Option<ReadbackCompletion> = None;

        for completion in self.receiver.try_iter() {
            if completion.samples.len() != expected {
                log::warn!("[FeedbackReadback::poll] Dropping readback from frame {}: {} samples, expected {}",
                           completion.frame, completion.samples.len(), expected);
                continue;
            }

            let is_newer = newest.as_ref().map_or(true, |n| completion.frame >= n.frame)
                && self.latest_issue_frame.map_or(true, |f| completion.frame >= f);
            if is_newer {
                newest = Some(completion);
            }
        }

        let Some(completion) = newest else {
            return false;
        };

        self.latest_issue_frame = Some(completion.frame);
        self.latest = completion.samples.into();
        self.last_update_frame = Some(frame);
        true
    }

    /// Samples the next analysis runs on; stale data is reused until a newer
    /// readback arrives
    pub fn latest(&self) -> Arc<[i32]> {
        Arc::clone(&self.latest)
    }

    pub fn uniforms(&self, frame: u32) -> FeedbackUniforms {
        FeedbackUniforms {
            size: self.size.to_array(),
            frame: frame & feedback::FRAME_DITHER_MASK,
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_uniforms_are_32_bytes() {
        assert_eq!(std::mem::size_of::<FeedbackUniforms>(), 32);
    }

    #[test]
    fn test_refresh_only_on_size_change() {
        let mut readback = FeedbackReadback::new(3);
        assert!(readback.refresh(1920, 1080));
        assert_eq!(readback.size(), UVec2::new(240, 135));
        assert_eq!(readback.latest().len(), 240 * 135);
        assert!(!readback.refresh(1920, 1080));
        assert!(readback.latest().iter().all(|&s| s == UNWRITTEN_SAMPLE));
    }

    #[test]
    fn test_poll_keeps_newest_matching_completion() {
        let mut readback = FeedbackReadback::new(0);
        readback.refresh(2, 2);
        let sender = readback.completion_sender();

        sender.send(ReadbackCompletion { frame: 5, samples: vec![-1; 4] }).unwrap();
        sender.send(ReadbackCompletion { frame: 6, samples: vec![-2; 9] }).unwrap();
        sender.send(ReadbackCompletion { frame: 4, samples: vec![-3; 4] }).unwrap();

        assert!(readback.poll(10));
        assert_eq!(&*readback.latest(), &[-1, -1, -1, -1]);
        assert_eq!(readback.last_update_frame(), Some(10));

        sender.send(ReadbackCompletion { frame: 3, samples: vec![-4; 4] }).unwrap();
        assert!(!readback.poll(11));
        assert!(!readback.poll(12));
        assert_eq!(readback.last_update_frame(), Some(10));
    }

    #[test]
    fn test_stale_size_after_resize_is_dropped() {
        let mut readback = FeedbackReadback::new(1);
        readback.refresh(8, 8);
        let sender = readback.completion_sender();
        sender.send(ReadbackCompletion { frame: 1, samples: vec![-1; 16] }).unwrap();

        readback.refresh(16, 16);
        assert!(!readback.poll(2));
        assert_eq!(readback.latest().len(), 64);
    }

    #[test]
    fn test_frame_is_masked() {
        let mut readback = FeedbackReadback::new(0);
        readback.refresh(4, 4);
        let uniforms = readback.uniforms(130);
        assert_eq!(uniforms.frame, 2);
        assert_eq!(uniforms.size, [4, 4]);
    }
}
