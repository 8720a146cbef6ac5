/// Sliding window over the most recent `N` samples, keeping a running sum so that the mean is
///  available in O(1). The thread pool uses this to smooth the per-role activity ratio between
///  rebalancing rounds.
pub struct RollingData<const N: usize> {
    buf: RingBuffer<N>,
    cached_sum: f64,
}
impl<const N: usize> Default for RollingData<N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<const N: usize> RollingData<N> {
    pub fn new() -> Self {
        assert!(N > 0);
        RollingData {
            buf: RingBuffer::new(),
            cached_sum: 0.0,
        }
    }

    pub fn add_value(&mut self, value: f64) {
        if let Some(evicted) = self.buf.add_value(value) {
            self.cached_sum -= evicted;
        }
        self.cached_sum += value;
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.len() == 0
    }

    /// mean of the samples in the window, 0.0 if there are none
    pub fn mean(&self) -> f64 {
        if self.buf.len() == 0 {
            return 0.0;
        }
        self.cached_sum / self.buf.len() as f64
    }

    pub fn clear(&mut self) {
        self.buf = RingBuffer::new();
        self.cached_sum = 0.0;
    }
}


/// Starts out as a growing vec and turns into a ring once `N` elements were added, so there is
///  no need for a sentinel 'empty' value.
enum RingBuffer<const N: usize> {
    Growing(Vec<f64>),
    Ring {
        buf: Vec<f64>,
        next: usize,
    },
}
impl <const N: usize> RingBuffer<N> {
    fn new() -> RingBuffer<N> {
        RingBuffer::Growing(Vec::with_capacity(N))
    }

    fn len(&self) -> usize {
        match self {
            RingBuffer::Growing(buf) => buf.len(),
            RingBuffer::Ring { buf, .. } => buf.len(),
        }
    }

    /// adds a new value, returning the value that was evicted in its place (if any)
    #[must_use]
    fn add_value(&mut self, value: f64) -> Option<f64> {
        match self {
            RingBuffer::Growing(buf) => {
                buf.push(value);
                if buf.len() == N {
                    let buf = std::mem::take(buf);
                    *self = RingBuffer::Ring { buf, next: 0 };
                }
                None
            }
            RingBuffer::Ring { buf, next } => {
                let evicted = buf[*next];
                buf[*next] = value;
                *next = (*next + 1) % N;
                Some(evicted)
            }
        }
    }
}
