mod platform;
mod simulation;

pub use simulation::*;

fn main() {
    #[cfg(not(target_arch = "wasm32"))]
    platform::start();
}
