
use std::fmt::Write;

/// Parity resynchronisation state of the array.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ResyncParity {
    Idle,
    InProgress,
    /// A failure stopped the walk; it must be restarted from the beginning.
    Interrupted,
}

/// MemberDisk is the health record for one slot (or the spare).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MemberDisk {
    /// Device index in the disk backend.
    pub dev: usize,
    /// Role number: the stripe slot this device serves.
    pub slot: usize,
    pub operational: bool,
    pub spare: bool,
    /// Receives writes but is never read from.
    pub write_only: bool,
}

/// What a disk failure did to the array.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum FailureOutcome {
    /// One member lost; still serving through reconstruction.
    Degraded { slot: usize },
    /// More members lost than parity can cover.
    ArrayFailed { slot: usize },
    /// The rebuild spare failed and was dropped.
    SpareLost,
    /// The device was not an operational member or the spare.
    Ignored,
}

/// DiskSnapshot is the coherent view of member health one state machine
/// invocation works from.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DiskSnapshot {
    /// Whether each slot may be read from (and counts as operational).
    pub operational: Vec<bool>,
    /// Device receiving writes aimed at each slot, if any.
    pub write_targets: Vec<Option<usize>>,
    pub failed_disks: usize,
}

impl DiskSnapshot {
    /// Device to read slot `i` from, if it may be read at all.
    #[must_use]
    pub fn read_dev(&self, i: usize) -> Option<usize> {
        if self.operational[i] {
            self.write_targets[i]
        } else {
            None
        }
    }

    #[must_use]
    pub fn non_operational(&self) -> usize {
        self.operational.iter().filter(|ok| !**ok).count()
    }
}

/// Array holds member health, the rebuild spare and resync state.
#[derive(Clone, Debug)]
pub struct Array {
    raid_disks: usize,
    disks: Vec<MemberDisk>,
    spare: Option<MemberDisk>,
    working_disks: usize,
    failed_disks: usize,
    resync_parity: ResyncParity,
}

impl Array {
    /// `new` assembles an array whose slot `i` is served by device `i`.
    #[must_use]
    pub fn new(raid_disks: usize) -> Self {
        let disks = (0..raid_disks)
            .map(|slot| MemberDisk {
                dev: slot,
                slot,
                operational: true,
                spare: false,
                write_only: false,
            })
            .collect();
        Self {
            raid_disks,
            disks,
            spare: None,
            working_disks: raid_disks,
            failed_disks: 0,
            resync_parity: ResyncParity::Idle,
        }
    }

    #[must_use]
    pub const fn raid_disks(&self) -> usize {
        self.raid_disks
    }

    #[must_use]
    pub const fn working_disks(&self) -> usize {
        self.working_disks
    }

    #[must_use]
    pub const fn failed_disks(&self) -> usize {
        self.failed_disks
    }

    #[must_use]
    pub fn disk(&self, slot: usize) -> Option<&MemberDisk> {
        self.disks.get(slot)
    }

    #[must_use]
    pub fn disks(&self) -> &[MemberDisk] {
        &self.disks
    }

    #[must_use]
    pub const fn spare(&self) -> Option<&MemberDisk> {
        self.spare.as_ref()
    }

    #[must_use]
    pub const fn resync_parity(&self) -> ResyncParity {
        self.resync_parity
    }

    /// True once more than one member is lost.
    #[must_use]
    pub const fn has_failed(&self) -> bool {
        self.failed_disks > 1
    }

    #[must_use]
    pub fn slot_of(&self, dev: usize) -> Option<usize> {
        self.disks.iter().position(|d| d.dev == dev)
    }

    /// `mark_disk_failed` takes the member served by `dev` out of service.
    ///
    /// # Arguments
    /// * `dev` - Backend device index that reported the failure.
    ///
    /// # Returns
    /// What the failure did to the array; repeated reports are ignored.
    pub fn mark_disk_failed(&mut self, dev: usize) -> FailureOutcome {
        if let Some(disk) = self.disks.iter_mut().find(|d| d.dev == dev && d.operational) {
            disk.operational = false;
            disk.write_only = false;
            let slot = disk.slot;
            self.working_disks -= 1;
            self.failed_disks += 1;
            if self.resync_parity == ResyncParity::InProgress {
                self.resync_parity = ResyncParity::Interrupted;
            }
            return if self.has_failed() {
                FailureOutcome::ArrayFailed { slot }
            } else {
                FailureOutcome::Degraded { slot }
            };
        }
        if self.spare.as_ref().is_some_and(|s| s.dev == dev) {
            self.spare = None;
            return FailureOutcome::SpareLost;
        }
        FailureOutcome::Ignored
    }

    /// `attach_spare` registers `dev` as the rebuild target for a failed slot.
    ///
    /// # Errors
    /// Returns an error if a spare is already active, the slot is out of
    /// range or still operational, or `dev` already serves a slot.
    pub fn attach_spare(&mut self, dev: usize, slot: usize) -> anyhow::Result<()> {
        if slot >= self.raid_disks {
            anyhow::bail!("disk index out of range: {slot} (raid_disks={})", self.raid_disks);
        }
        if let Some(spare) = &self.spare {
            anyhow::bail!("spare device {} is already rebuilding slot {}", spare.dev, spare.slot);
        }
        if self.disks[slot].operational {
            anyhow::bail!("slot {slot} is operational; nothing to rebuild");
        }
        if self.disks.iter().any(|d| d.dev == dev && d.operational) {
            anyhow::bail!("device {dev} already serves a slot");
        }
        self.spare = Some(MemberDisk {
            dev,
            slot,
            operational: true,
            spare: true,
            write_only: true,
        });
        Ok(())
    }

    /// `promote_spare` turns the rebuilt spare into the member for its slot.
    ///
    /// # Errors
    /// Returns an error if no spare is attached.
    pub fn promote_spare(&mut self) -> anyhow::Result<usize> {
        let Some(spare) = self.spare.take() else {
            anyhow::bail!("no spare attached");
        };
        let slot = spare.slot;
        self.disks[slot] = MemberDisk {
            dev: spare.dev,
            slot,
            operational: true,
            spare: false,
            write_only: false,
        };
        self.failed_disks -= 1;
        self.working_disks += 1;
        Ok(slot)
    }

    /// # Errors
    /// Returns an error if the slot is out of range.
    pub fn set_write_only(&mut self, slot: usize, write_only: bool) -> anyhow::Result<()> {
        let Some(disk) = self.disks.get_mut(slot) else {
            anyhow::bail!("disk index out of range: {slot} (raid_disks={})", self.raid_disks);
        };
        disk.write_only = write_only;
        Ok(())
    }

    /// # Errors
    /// Returns an error while the array is degraded; parity cannot be
    /// resynchronised without every member.
    pub fn begin_resync(&mut self) -> anyhow::Result<()> {
        if self.failed_disks > 0 {
            anyhow::bail!(
                "cannot resync parity with {} failed disk(s)",
                self.failed_disks
            );
        }
        self.resync_parity = ResyncParity::InProgress;
        Ok(())
    }

    /// Ends a resync walk, returning the state it ended in.
    pub fn end_resync(&mut self) -> ResyncParity {
        let prev = self.resync_parity;
        if prev == ResyncParity::InProgress {
            self.resync_parity = ResyncParity::Idle;
        }
        prev
    }

    /// `snapshot` captures member health for the stripe whose parity lives on `pd_idx`.
    #[must_use]
    pub fn snapshot(&self, pd_idx: usize) -> DiskSnapshot {
        let resyncing = self.resync_parity == ResyncParity::InProgress && self.failed_disks == 0;
        let operational = self
            .disks
            .iter()
            .map(|d| d.operational && !d.write_only && !(resyncing && d.slot == pd_idx))
            .collect();
        let write_targets = self
            .disks
            .iter()
            .map(|d| {
                if d.operational {
                    Some(d.dev)
                } else {
                    self.spare
                        .as_ref()
                        .filter(|s| s.slot == d.slot)
                        .map(|s| s.dev)
                }
            })
            .collect();
        DiskSnapshot {
            operational,
            write_targets,
            failed_disks: self.failed_disks,
        }
    }

    #[must_use]
    pub fn status_string(&self) -> String {
        let mut out = String::new();
        for d in &self.disks {
            let state = if d.operational {
                if d.write_only { "WRITE_ONLY" } else { "OK" }
            } else if self.spare.as_ref().is_some_and(|s| s.slot == d.slot) {
                "FAILED (rebuilding)"
            } else {
                "FAILED"
            };
            let _ = writeln!(out, "disk {}: {state} (dev={})", d.slot, d.dev);
        }
        if let Some(spare) = &self.spare {
            let _ = writeln!(out, "spare: dev={} -> slot {}", spare.dev, spare.slot);
        }
        let _ = writeln!(
            out,
            "working={} failed={} resync={:?}",
            self.working_disks, self.failed_disks, self.resync_parity
        );
        out
    }
}
