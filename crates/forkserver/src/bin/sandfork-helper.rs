// crates/forkserver/src/bin/sandfork-helper.rs

//! The fork-server helper. Started by the supervisor with its channel on
//! the reserved descriptor slot; serves spawn requests until the channel
//! closes.

use comms::Comms;
use logging::SubscriberConfig;

fn main() {
    logging::init(SubscriberConfig::default());
    let comms = match Comms::client() {
        Ok(comms) => comms,
        Err(err) => {
            eprintln!("sandfork-helper: {err}");
            std::process::exit(2);
        }
    };
    if let Err(err) = forkserver::serve(comms) {
        eprintln!("sandfork-helper: {err}");
        std::process::exit(1);
    }
}
