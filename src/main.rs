use std::{env, time};

const DEFAULT_DELAY_MS: u64 = 2000;
const DEFAULT_WAIT_MS: u64 = 3000;

fn parse_arg(arg: Option<String>, default: u64) -> u64 {
	match arg.map(|a| a.parse::<u64>()) {
		None => default,
		Some(Ok(ms)) => ms,
		Some(Err(err)) => {
			eprintln!("usage: resumable [DELAY_MS] [WAIT_MS] ({}), using {} ms", err, default);
			default
		}
	}
}

fn main() {
	let mut args = env::args().skip(1);
	let delay_ms = parse_arg(args.next(), DEFAULT_DELAY_MS);
	let wait_ms = parse_arg(args.next(), DEFAULT_WAIT_MS);

	let mut task = resumable::spawn(async move {
		println!("Task started, waiting for {} ms...", delay_ms);
		resumable::delay_ms(delay_ms).await;
		println!("Task resumed after {} ms.", delay_ms);
	});

	// bounded by the wait, but returns as soon as the task is done
	if let Err(err) = task.join_timeout(time::Duration::from_millis(wait_ms)) {
		eprintln!("{}", err);
	}

	println!("Main thread exiting.");
}
