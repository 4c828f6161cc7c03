//! Receive-depth bookkeeping. Keeps a connection's receive queue close to a
//! target depth by re-posting empty receives in batches as completions are
//! drained, so the hardware never runs dry and answers with RNR.
use crate::connection::{Connection, Error};

pub struct RecvQueue {
    depth: usize,
    posted: usize,
}

impl RecvQueue {
    pub fn new(depth: usize) -> Self {
        RecvQueue { depth, posted: 0 }
    }

    /// Fill the queue to the target depth. Called once right after the
    /// connection is established.
    pub fn prime(&mut self, conn: &mut Connection) -> Result<usize, Error> {
        let posted = conn.post_batched_empty_recv(self.depth)?;
        self.posted = posted;
        Ok(posted)
    }

    /// Record `n` drained receive completions.
    pub fn consumed(&mut self, n: usize) {
        debug_assert!(n <= self.posted);
        self.posted = self.posted.saturating_sub(n);
    }

    /// How far below the target depth the queue currently sits.
    pub fn deficit(&self) -> usize {
        self.depth - self.posted
    }

    /// Re-post as many empty receives as were consumed since the last
    /// refill. Batched, so the doorbell cost amortizes across the deficit.
    pub fn refill(&mut self, conn: &mut Connection) -> Result<usize, Error> {
        let deficit = self.deficit();
        if deficit == 0 {
            return Ok(0);
        }
        let posted = conn.post_batched_empty_recv(deficit)?;
        self.posted += posted;
        Ok(posted)
    }

    pub fn depth(&self) -> usize {
        self.depth
    }

    pub fn posted(&self) -> usize {
        self.posted
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deficit_tracking() {
        let mut queue = RecvQueue::new(64);
        assert_eq!(queue.deficit(), 64);
        queue.posted = 64;
        queue.consumed(16);
        assert_eq!(queue.posted(), 48);
        assert_eq!(queue.deficit(), 16);
        queue.consumed(48);
        assert_eq!(queue.deficit(), 64);
    }
}
