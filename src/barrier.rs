// MAXWELL TICK BARRIER
// TWO-PHASE BARRIER BUILT FROM AN ARRIVAL COUNTER AND A GENERATION
// WORD. PHASE A: EVERY SAMPLER PUBLISHES ITS SAMPLE AND ARRIVES; THE
// MASTER WAITS FOR ALL ARRIVALS AND RUNS THE CONTROLLER IN THE HELD
// WINDOW. PHASE B: THE MASTER CLEARS THE COUNTER AND BUMPS THE
// GENERATION; EVERYONE ELSE WAITS ON THE GENERATION.
//
// THE GENERATION WORD IS WHAT MAKES THE BARRIER REUSABLE: A FAST
// SAMPLER THAT SLEEPS, WAKES, AND ARRIVES AGAIN CANNOT BE CONFUSED
// WITH A STRAGGLER FROM THE PREVIOUS TICK.
//
// SHUTDOWN IS CHECKED IN EVERY SPIN SO ALL THREADS LEAVE THE BARRIER
// WITHIN ONE TICK OF THE FLAG BEING SET.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};

pub struct TickBarrier {
    arrivals: AtomicU32,
    generation: AtomicU64,
    participants: u32,
}

impl TickBarrier {
    pub fn new(participants: u32) -> Self {
        Self {
            arrivals: AtomicU32::new(0),
            generation: AtomicU64::new(0),
            participants,
        }
    }

    pub fn participants(&self) -> u32 {
        self.participants
    }

    // PHASE A ENTRY. THE RELEASE PAIRS WITH THE MASTER'S ACQUIRE IN
    // wait_all(), MAKING THE SAMPLE PUBLISH VISIBLE TO THE CONTROLLER.
    // RETURNS THE GENERATION TO WAIT ON.
    pub fn arrive(&self) -> u64 {
        let gen = self.generation.load(Ordering::Acquire);
        self.arrivals.fetch_add(1, Ordering::AcqRel);
        gen
    }

    // MASTER: WAIT UNTIL ALL PARTICIPANTS ARRIVED. RETURNS FALSE WHEN
    // SHUTDOWN WAS REQUESTED INSTEAD.
    pub fn wait_all(&self, shutdown: &AtomicBool) -> bool {
        let mut spins: u32 = 0;
        while self.arrivals.load(Ordering::Acquire) < self.participants {
            if shutdown.load(Ordering::Relaxed) {
                return false;
            }
            spins = spins.wrapping_add(1);
            if spins % 1024 == 0 {
                std::thread::yield_now();
            } else {
                std::hint::spin_loop();
            }
        }
        true
    }

    // MASTER: PHASE B. THE RELEASE ON THE GENERATION PAIRS WITH THE
    // ACQUIRE IN wait_release(), MAKING THE DECISION CELLS VISIBLE TO
    // THE PRIMARIES BEFORE THEY APPLY MSRS.
    pub fn release(&self) {
        self.arrivals.store(0, Ordering::Release);
        self.generation.fetch_add(1, Ordering::AcqRel);
    }

    // NON-MASTER: WAIT FOR THE GENERATION TO MOVE PAST THE ONE OBSERVED
    // AT ARRIVAL. RETURNS FALSE ON SHUTDOWN.
    pub fn wait_release(&self, gen: u64, shutdown: &AtomicBool) -> bool {
        let mut spins: u32 = 0;
        while self.generation.load(Ordering::Acquire) == gen {
            if shutdown.load(Ordering::Relaxed) {
                return false;
            }
            spins = spins.wrapping_add(1);
            if spins % 1024 == 0 {
                std::thread::yield_now();
            } else {
                std::hint::spin_loop();
            }
        }
        true
    }

    #[cfg(test)]
    fn arrivals_now(&self) -> u32 {
        self.arrivals.load(Ordering::Acquire)
    }
}
