use std::collections::VecDeque;

use crate::jsonrpc::{self, Frame, JsonRpcId};

/// Hold-and-forward queue for client→server frames awaiting a ready session.
///
/// At most one initialize handshake is ever held, and always at the front so
/// it is the first frame replayed after a reconnect.
#[derive(Debug, Default)]
pub struct FrameQueue {
    frames: VecDeque<Frame>,
}

impl FrameQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    pub fn push(&mut self, frame: Frame) {
        if frame.is_initialize_handshake() {
            // The client's own handshake supersedes a primed canonical one.
            if self
                .frames
                .front()
                .is_some_and(Frame::is_initialize_handshake)
            {
                self.frames[0] = frame;
            } else {
                self.frames.push_front(frame);
            }
            return;
        }
        self.frames.push_back(frame);
    }

    /// Requeue a frame ahead of everything except the handshake.
    pub fn push_front(&mut self, frame: Frame) {
        if !frame.is_initialize_handshake()
            && self
                .frames
                .front()
                .is_some_and(Frame::is_initialize_handshake)
        {
            self.frames.insert(1, frame);
        } else {
            self.frames.push_front(frame);
        }
    }

    pub fn pop_front(&mut self) -> Option<Frame> {
        self.frames.pop_front()
    }

    /// Drop any held frame with the given id. Returns true when one was held.
    pub fn remove_by_id(&mut self, id: &JsonRpcId) -> bool {
        let before = self.frames.len();
        self.frames.retain(|f| f.id().as_ref() != Some(id));
        self.frames.len() != before
    }

    /// Drop id-less frames; notifications do not survive a reconnect.
    pub fn drop_notifications(&mut self) {
        self.frames.retain(|f| f.id().is_some());
    }

    /// Move the initialize handshake to the front, inserting the canonical
    /// one when the client's own is not held.
    pub fn promote_initialize(&mut self) {
        match self.frames.iter().position(Frame::is_initialize_handshake) {
            Some(0) => {}
            Some(pos) => {
                if let Some(f) = self.frames.remove(pos) {
                    self.frames.push_front(f);
                }
            }
            None => self.frames.push_front(jsonrpc::initialize_handshake()),
        }
    }
}
