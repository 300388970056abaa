#[derive(Debug, Default, Clone, Copy)]
pub struct LaneStats {
    pub iterations: u64,
    pub traversals: u64,
    pub any_hit_invocations: u64,
    pub intersection_invocations: u64,
}

impl std::ops::AddAssign for LaneStats {
    fn add_assign(&mut self, rhs: Self) {
        self.iterations += rhs.iterations;
        self.traversals += rhs.traversals;
        self.any_hit_invocations += rhs.any_hit_invocations;
        self.intersection_invocations += rhs.intersection_invocations;
    }
}

#[derive(Default)]
pub struct Report {
    pub lanes: u64,
    pub workgroups: u64,
    pub scratch_size: u32,
    pub stats: LaneStats,
    pub duration: std::time::Duration,
}

impl std::fmt::Debug for Report {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "Launch:")?;
        writeln!(
            f,
            "\t{lanes} lanes in {workgroups} workgroups, {scratch} bytes of scratch per lane",
            lanes = self.lanes,
            workgroups = self.workgroups,
            scratch = self.scratch_size,
        )?;
        writeln!(
            f,
            "\t{iterations: <10} loop iterations",
            iterations = self.stats.iterations
        )?;
        writeln!(
            f,
            "\t{traversals: <10} traversals",
            traversals = self.stats.traversals
        )?;
        writeln!(
            f,
            "\t{any_hit: <10} any-hit / {isec} intersection invocations",
            any_hit = self.stats.any_hit_invocations,
            isec = self.stats.intersection_invocations,
        )?;
        writeln!(f, "\ttook {duration:?}", duration = self.duration)?;
        Ok(())
    }
}
