use parking_lot::Mutex;
use rand::seq::SliceRandom;
use rand::Rng;


/// Feedback masks of maximal-period 32 bit Galois LFSRs (i.e. primitive polynomials). The
///  period is 2^32 - 1, so the register never revisits a state before it has visited all of
///  them.
const MAXIMAL_PERIOD_MASKS: [u32; 8] = [
    0x8020_0003,
    0x8000_0057,
    0x8000_0062,
    0x8000_007A,
    0x8000_0092,
    0x8000_00B9,
    0x8000_00BA,
    0x8000_0106,
];

/// upper bound for the number of LFSR steps per generated token
const MAX_STEPS_PER_TOKEN: u32 = 8;


/// Generates the connection tokens that bind a UDP flow to a session that was authenticated on
///  the TCP channel.
///
/// Tokens are not cryptographically secure, but they are not sequential either: a Galois LFSR
///  with random seed and random (maximal-period) feedback mask is stepped a random number of
///  times per token, its state is run through a random bit permutation and then XORed with a
///  random mask. All of this is fixed at construction time, so the generator is process-local.
///
/// Since the LFSR does not repeat a state within its period and the permutation / XOR are
///  bijective, tokens are unique for the first ~2^29 calls.
pub struct TokenGenerator {
    state: Mutex<u32>,
    feedback_mask: u32,
    permutation: [u8; 32],
    xor_mask: u32,
}

impl Default for TokenGenerator {
    fn default() -> Self {
        Self::new()
    }
}

impl TokenGenerator {
    pub fn new() -> TokenGenerator {
        let mut rng = rand::thread_rng();

        let seed = loop {
            let candidate: u32 = rng.gen();
            if candidate != 0 {
                break candidate;
            }
        };

        let feedback_mask = MAXIMAL_PERIOD_MASKS[rng.gen_range(0..MAXIMAL_PERIOD_MASKS.len())];

        let mut permutation: [u8; 32] = std::array::from_fn(|i| i as u8);
        permutation.shuffle(&mut rng);

        TokenGenerator {
            state: Mutex::new(seed),
            feedback_mask,
            permutation,
            xor_mask: rng.gen(),
        }
    }

    /// Returns a fresh non-zero token (zero is reserved for 'no token')
    pub fn generate_token(&self) -> u32 {
        let num_steps = rand::thread_rng().gen_range(1..=MAX_STEPS_PER_TOKEN);

        loop {
            let raw = {
                let mut state = self.state.lock();
                for _ in 0..num_steps {
                    *state = Self::step(*state, self.feedback_mask);
                }
                *state
            };

            let token = self.shuffle(raw) ^ self.xor_mask;
            if token != 0 {
                return token;
            }
        }
    }

    fn step(state: u32, feedback_mask: u32) -> u32 {
        let lsb = state & 1;
        let shifted = state >> 1;
        if lsb != 0 {
            shifted ^ feedback_mask
        }
        else {
            shifted
        }
    }

    fn shuffle(&self, value: u32) -> u32 {
        let mut result = 0u32;
        for (from, &to) in self.permutation.iter().enumerate() {
            result |= ((value >> from) & 1) << to;
        }
        result
    }
}
