//! The worker pool LDAP work is pinned to.
//!
//! Each worker is a serial executor owning its own [`ConnectionCache`];
//! within a worker, operations run strictly in submission order, so the
//! cache needs no locking. A whole login or authorization call is one job
//! and therefore pinned to a single worker for its duration.

use std::{
	future::{self, Future},
	pin::Pin,
	sync::atomic::{AtomicUsize, Ordering},
	time::Duration,
};

use tokio::{
	sync::{mpsc, oneshot},
	time::{sleep_until, Instant},
};

use crate::{cache::ConnectionCache, error::Error};

/// A unit of work executed on one worker, with access to its cache.
type Job = Box<
	dyn for<'a> FnOnce(&'a mut ConnectionCache) -> Pin<Box<dyn Future<Output = ()> + Send + 'a>>
		+ Send,
>;

/// Identity helper pinning a closure to the job signature.
pub(crate) fn job<T, F>(f: F) -> F
where
	T: Send + 'static,
	F: for<'a> FnOnce(
			&'a mut ConnectionCache,
		) -> Pin<Box<dyn Future<Output = Result<T, Error>> + Send + 'a>>
		+ Send
		+ 'static,
{
	f
}

/// A fixed set of serial workers fed round-robin.
pub(crate) struct WorkerPool {
	senders: Vec<mpsc::Sender<Job>>,
	next: AtomicUsize,
}

impl WorkerPool {
	/// Spawn `size` workers. Must be called within a Tokio runtime.
	pub(crate) fn new(size: usize, idle_timeout: Option<Duration>) -> Self {
		let senders = (0..size.max(1))
			.map(|_| {
				let (sender, receiver) = mpsc::channel::<Job>(64);
				tokio::spawn(worker_loop(receiver, idle_timeout));
				sender
			})
			.collect();
		WorkerPool { senders, next: AtomicUsize::new(0) }
	}

	/// Submit one job and wait for its result.
	pub(crate) async fn run<T, F>(&self, work: F) -> Result<T, Error>
	where
		T: Send + 'static,
		F: for<'a> FnOnce(
				&'a mut ConnectionCache,
			) -> Pin<Box<dyn Future<Output = Result<T, Error>> + Send + 'a>>
			+ Send
			+ 'static,
	{
		let (sender, receiver) = oneshot::channel();
		let boxed: Job = Box::new(move |cache| {
			Box::pin(async move {
				let _ = sender.send(work(cache).await);
			})
		});
		let index = self.next.fetch_add(1, Ordering::Relaxed) % self.senders.len();
		self.senders[index].send(boxed).await.map_err(|_| Error::Pool)?;
		receiver.await.map_err(|_| Error::Pool)?
	}
}

/// One worker: drain jobs in order, evicting idle connections between them.
async fn worker_loop(mut jobs: mpsc::Receiver<Job>, idle_timeout: Option<Duration>) {
	let mut cache = ConnectionCache::new(idle_timeout);
	loop {
		tokio::select! {
			job = jobs.recv() => match job {
				Some(job) => job(&mut cache).await,
				None => break,
			},
			() = idle_sleep(cache.next_expiry()) => cache.evict_idle().await,
		}
	}
	cache.close_all().await;
}

/// Sleep until the next idle deadline, or forever when there is none.
async fn idle_sleep(deadline: Option<Instant>) {
	match deadline {
		Some(deadline) => sleep_until(deadline).await,
		None => future::pending().await,
	}
}
