//! Folding collected blobs into weighted call stacks, e.g. for flamegraphs.

use crate::stacks::segments;

use itertools::Itertools;
use perfcollect_proto::{Blob, Payload};
use std::collections::HashMap;

/// Call stacks with their accumulated weight, innermost frame first.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct FoldedStacks {
    stacks: HashMap<Vec<u64>, u64>,
}

impl FoldedStacks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, frames: &[u64], weight: u64) {
        if frames.is_empty() || weight == 0 {
            return;
        }
        *self.stacks.entry(frames.to_vec()).or_default() += weight;
    }

    /// Adds the samples or events of one blob. Sampled addresses weigh their
    /// sample count and traced calls one each.
    pub fn add_blob(&mut self, blob: &Blob) {
        match &blob.payload {
            Some(Payload::Pcsamp(data)) => {
                for (pc, count) in data.pc.iter().zip(&data.count) {
                    self.add(&[*pc], *count);
                }
            }
            Some(Payload::Hwcsamp(data)) => {
                for (pc, count) in data.pc.iter().zip(&data.count) {
                    self.add(&[*pc], *count);
                }
            }
            Some(Payload::Usertime(data)) => {
                for (frames, count) in counted_stacks(&data.stacktraces, &data.count) {
                    self.add(frames, count);
                }
            }
            Some(Payload::Io(data)) => {
                for event in &data.events {
                    self.add(stack_at(&data.stacktraces, event.stacktrace), 1);
                }
            }
            Some(Payload::Mem(data)) => {
                for event in &data.events {
                    self.add(stack_at(&data.stacktraces, event.stacktrace), 1);
                }
            }
            Some(Payload::Mpi(data)) => {
                for event in &data.events {
                    self.add(stack_at(&data.stacktraces, event.stacktrace), 1);
                }
            }
            Some(Payload::Pthreads(data)) => {
                for event in &data.events {
                    self.add(stack_at(&data.stacktraces, event.stacktrace), 1);
                }
            }
            Some(Payload::LinkedObjects(_)) | None => {}
        }
    }

    pub fn len(&self) -> usize {
        self.stacks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stacks.is_empty()
    }

    pub fn total(&self) -> u64 {
        self.stacks.values().sum()
    }

    /// One `root;...;leaf weight` line per stack, sorted.
    pub fn to_folded(&self) -> String {
        self.stacks
            .iter()
            .map(|(frames, weight)| {
                let path = frames.iter().rev().map(|frame| format!("{frame:#x}")).join(";");
                format!("{path} {weight}")
            })
            .sorted()
            .join("\n")
    }
}

/// Stacks of a count-indexed table: every stack starts at a slot with a
/// nonzero count and runs up to the next one.
pub fn counted_stacks<'a>(
    stacktraces: &'a [u64],
    counts: &'a [u32],
) -> impl Iterator<Item = (&'a [u64], u64)> + 'a {
    let len = stacktraces.len().min(counts.len());
    let starts: Vec<usize> = (0..len).filter(|slot| counts[*slot] != 0).collect();
    let ends: Vec<usize> = starts.iter().skip(1).copied().chain([len]).collect();
    starts
        .into_iter()
        .zip(ends)
        .map(move |(start, end)| (&stacktraces[start..end], counts[start] as u64))
}

/// The zero-terminated stack stored at `offset`.
pub fn stack_at(stacktraces: &[u64], offset: u32) -> &[u64] {
    let rest = stacktraces.get(offset as usize..).unwrap_or(&[]);
    segments(rest).next().map(|(_, frames)| frames).unwrap_or(&[])
}

#[cfg(test)]
mod tests {
    use super::*;
    use perfcollect_proto::{IoEvent, IoTraceData, PcSampData, UsertimeData};

    #[test]
    fn test_counted_stacks() {
        let stacktraces = [0x1, 0x2, 0x3, 0x1, 0x4];
        let counts = [2, 0, 0, 1, 0];
        let stacks: Vec<_> = counted_stacks(&stacktraces, &counts).collect();
        assert_eq!(
            stacks,
            vec![(&[0x1, 0x2, 0x3][..], 2), (&[0x1, 0x4][..], 1)]
        );
    }

    #[test]
    fn test_stack_at() {
        let stacktraces = [0xa, 0xb, 0xc, 0, 0xa, 0xd, 0];
        assert_eq!(stack_at(&stacktraces, 0), &[0xa, 0xb, 0xc]);
        assert_eq!(stack_at(&stacktraces, 4), &[0xa, 0xd]);
        assert!(stack_at(&stacktraces, 40).is_empty());
    }

    #[test]
    fn test_fold_blobs() {
        let mut folded = FoldedStacks::new();
        folded.add_blob(&Blob {
            header: None,
            payload: Some(Payload::Pcsamp(PcSampData {
                interval: 1,
                pc: vec![0x100, 0x200],
                count: vec![3, 1],
            })),
        });
        folded.add_blob(&Blob {
            header: None,
            payload: Some(Payload::Usertime(UsertimeData {
                interval: 1,
                stacktraces: vec![0x100, 0x300],
                count: vec![2, 0],
                weight: vec![2, 0],
            })),
        });
        folded.add_blob(&Blob {
            header: None,
            payload: Some(Payload::Io(IoTraceData {
                stacktraces: vec![0x100, 0x300, 0],
                events: vec![IoEvent::default(), IoEvent::default()],
            })),
        });

        assert_eq!(folded.len(), 3);
        assert_eq!(folded.total(), 8);
        insta::assert_snapshot!(folded.to_folded(), @r"
        0x100 3
        0x200 1
        0x300;0x100 4
        ");
    }
}
