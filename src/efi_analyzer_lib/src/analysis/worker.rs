//! A scoped worker pool for the per-function stages of the analysis.

/// Apply `job` to every item using up to `threads` worker threads.
///
/// The results are returned in the order of the items.
/// A thread count of zero uses the available parallelism of the machine.
/// The items are distributed over a job channel, so long-running jobs do not block the other workers.
pub fn parallel_map<T, R, F>(items: &[T], threads: usize, job: F) -> Vec<R>
where
    T: Sync,
    R: Send,
    F: Fn(&T) -> R + Sync,
{
    let threads = match threads {
        0 => std::thread::available_parallelism()
            .map(usize::from)
            .unwrap_or(1),
        threads => threads,
    }
    .min(items.len());
    if threads <= 1 {
        return items.iter().map(job).collect();
    }
    let (job_sender, job_receiver) = crossbeam_channel::unbounded::<usize>();
    let (result_sender, result_receiver) = crossbeam_channel::unbounded::<(usize, R)>();
    for index in 0..items.len() {
        let _ = job_sender.send(index);
    }
    drop(job_sender);
    std::thread::scope(|scope| {
        for _ in 0..threads {
            let job_receiver = job_receiver.clone();
            let result_sender = result_sender.clone();
            let job = &job;
            scope.spawn(move || {
                while let Ok(index) = job_receiver.recv() {
                    if result_sender.send((index, job(&items[index]))).is_err() {
                        break;
                    }
                }
            });
        }
    });
    drop(result_sender);
    let mut results: Vec<Option<R>> = (0..items.len()).map(|_| None).collect();
    for (index, result) in result_receiver.try_iter() {
        results[index] = Some(result);
    }
    results.into_iter().flatten().collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn results_keep_item_order() {
        let items: Vec<u64> = (0..100).collect();
        let results = parallel_map(&items, 4, |item| item * 2);
        assert_eq!(results, (0..100).map(|item| item * 2).collect::<Vec<u64>>());
        let results = parallel_map(&items, 1, |item| item + 1);
        assert_eq!(results[99], 100);
        assert!(parallel_map(&Vec::<u64>::new(), 0, |item| *item).is_empty());
    }
}
