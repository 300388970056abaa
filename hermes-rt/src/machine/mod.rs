mod handler;
mod lane;
mod report;

use itertools::Itertools;

use crate::config::Config;
use crate::ir::VarType;
use crate::memory::{GlobalMemory, Scratch};
use crate::pipeline::Pipeline;
use crate::query::{self, RayQueryArray};
use crate::sbt::ShaderBindingTable;

pub use lane::Registers;
use lane::Lane;
pub use report::{LaneStats, Report};

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("Lane {lane} ended with dispatch index {idx}, which matches no stage!")]
    UnreachableDispatch { idx: u32, lane: u64 },
    #[error("Lane {lane} exceeded the limit of {limit} loop iterations!")]
    IterationLimit { lane: u64, limit: u64 },
    #[error("Expected a value of type {expected:?} but got {found:?}!")]
    TypeMismatch { expected: VarType, found: VarType },
    #[error("Invalid operands for {op}!")]
    InvalidOperands { op: String },
    #[error("Ray query {0} does not exist!")]
    InvalidQuery(usize),
    #[error("{0} has to be lowered before execution!")]
    Unlowered(&'static str),
    #[error(transparent)]
    QueryError(#[from] query::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

///
/// Executes compiled pipelines over an emulated device memory.
///
/// Lanes run one after another; consecutive lanes form a workgroup and
/// share the memory backing the traversal stacks.
///
#[derive(Debug, Default)]
pub struct Machine {
    pub memory: GlobalMemory,
    pub config: Config,
}

impl Machine {
    pub fn new(config: Config) -> Self {
        Self {
            memory: GlobalMemory::new(),
            config,
        }
    }

    #[profiling::function]
    pub fn launch(
        &mut self,
        pipeline: &Pipeline,
        sbt: &ShaderBindingTable,
        size: [u32; 3],
    ) -> Result<Report> {
        let start = std::time::Instant::now();
        let config = &self.config;
        let lanes = config.workgroup_size.max(1);
        let scratch_size = pipeline.scratch_size();
        let query_elements = pipeline.query_sizes.iter().sum::<u32>();

        let mut lds = vec![0u32; (lanes * config.lds_stack_entries) as usize];
        let query_entries = config.shared_stack_entries.max(1);
        let mut query_lds = vec![0u32; (lanes * query_entries * query_elements) as usize];

        let mut report = Report {
            scratch_size,
            ..Default::default()
        };

        let ids = (0..size[2])
            .cartesian_product(0..size[1])
            .cartesian_product(0..size[0])
            .map(|((z, y), x)| [x, y, z]);

        for (i, launch_id) in ids.enumerate() {
            let lane = i as u32 % lanes;
            if lane == 0 {
                profiling::scope!("workgroup");
                report.workgroups += 1;
                lds.fill(0);
                query_lds.fill(0);
            }

            let mut scratch = Scratch::new(scratch_size as usize);
            let mut regs = Registers::new();
            let mut queries = pipeline
                .query_sizes
                .iter()
                .map(|&len| RayQueryArray::new(len as usize, config.scratch_stack_entries))
                .collect_vec();
            let mut stats = LaneStats::default();

            let mut state = Lane {
                pipeline,
                sbt,
                config,
                index: i as u64,
                lane,
                launch_id,
                launch_size: size,
                regs: &mut regs,
                scratch: scratch.view(),
                lds: &mut lds,
                queries: &mut queries,
                query_lds: &mut query_lds,
                stats: &mut stats,
            };
            state.run(&mut self.memory)?;

            report.stats += stats;
            report.lanes += 1;
        }

        report.duration = start.elapsed();
        log::debug!("{report:?}");
        Ok(report)
    }
}
