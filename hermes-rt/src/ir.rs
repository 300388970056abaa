use glam::{Vec2, Vec3};

use crate::node::InstanceField;
use crate::op::{BinOp, UnOp};
use crate::pipeline::{Stage, StageKind};
use crate::query::QueryValue;
use crate::sbt::SbtKind;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum VarType {
    Bool,
    U32,
    F32,
    U64,
    Vec2,
    Vec3,
}

impl VarType {
    pub fn size(&self) -> u32 {
        match self {
            VarType::Bool => 4,
            VarType::U32 => 4,
            VarType::F32 => 4,
            VarType::U64 => 8,
            VarType::Vec2 => 8,
            VarType::Vec3 => 12,
        }
    }
    pub fn alignment(&self) -> u32 {
        match self {
            VarType::U64 => 8,
            _ => 4,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Value {
    Bool(bool),
    U32(u32),
    F32(f32),
    U64(u64),
    Vec2(Vec2),
    Vec3(Vec3),
}

impl Value {
    pub fn zero(ty: VarType) -> Self {
        match ty {
            VarType::Bool => Value::Bool(false),
            VarType::U32 => Value::U32(0),
            VarType::F32 => Value::F32(0.),
            VarType::U64 => Value::U64(0),
            VarType::Vec2 => Value::Vec2(Vec2::ZERO),
            VarType::Vec3 => Value::Vec3(Vec3::ZERO),
        }
    }
    pub fn ty(&self) -> VarType {
        match self {
            Value::Bool(_) => VarType::Bool,
            Value::U32(_) => VarType::U32,
            Value::F32(_) => VarType::F32,
            Value::U64(_) => VarType::U64,
            Value::Vec2(_) => VarType::Vec2,
            Value::Vec3(_) => VarType::Vec3,
        }
    }
    pub fn to_bytes(&self) -> Vec<u8> {
        match self {
            Value::Bool(v) => (*v as u32).to_le_bytes().to_vec(),
            Value::U32(v) => v.to_le_bytes().to_vec(),
            Value::F32(v) => v.to_le_bytes().to_vec(),
            Value::U64(v) => v.to_le_bytes().to_vec(),
            Value::Vec2(v) => bytemuck::cast_slice(&v.to_array()).to_vec(),
            Value::Vec3(v) => bytemuck::cast_slice(&v.to_array()).to_vec(),
        }
    }
    /// `bytes` has to hold at least `ty.size()` bytes.
    pub fn from_bytes(ty: VarType, bytes: &[u8]) -> Self {
        let word = |i: usize| {
            let mut w = [0u8; 4];
            w.copy_from_slice(&bytes[i * 4..i * 4 + 4]);
            w
        };
        match ty {
            VarType::Bool => Value::Bool(u32::from_le_bytes(word(0)) != 0),
            VarType::U32 => Value::U32(u32::from_le_bytes(word(0))),
            VarType::F32 => Value::F32(f32::from_le_bytes(word(0))),
            VarType::U64 => {
                let lo = u32::from_le_bytes(word(0)) as u64;
                let hi = u32::from_le_bytes(word(1)) as u64;
                Value::U64(lo | (hi << 32))
            }
            VarType::Vec2 => Value::Vec2(Vec2::new(
                f32::from_le_bytes(word(0)),
                f32::from_le_bytes(word(1)),
            )),
            VarType::Vec3 => Value::Vec3(Vec3::new(
                f32::from_le_bytes(word(0)),
                f32::from_le_bytes(word(1)),
                f32::from_le_bytes(word(2)),
            )),
        }
    }
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(v) => Some(*v),
            _ => None,
        }
    }
    pub fn as_u32(&self) -> Option<u32> {
        match self {
            Value::U32(v) => Some(*v),
            _ => None,
        }
    }
    pub fn as_f32(&self) -> Option<f32> {
        match self {
            Value::F32(v) => Some(*v),
            _ => None,
        }
    }
    pub fn as_u64(&self) -> Option<u64> {
        match self {
            Value::U64(v) => Some(*v),
            _ => None,
        }
    }
    pub fn as_vec2(&self) -> Option<Vec2> {
        match self {
            Value::Vec2(v) => Some(*v),
            _ => None,
        }
    }
    pub fn as_vec3(&self) -> Option<Vec3> {
        match self {
            Value::Vec3(v) => Some(*v),
            _ => None,
        }
    }
}

macro_rules! value_from {
    ($($ty:ty => $variant:ident),*) => {
        $(
            impl From<$ty> for Value {
                fn from(v: $ty) -> Self {
                    Value::$variant(v)
                }
            }
            impl From<$ty> for Expr {
                fn from(v: $ty) -> Self {
                    Expr::Lit(Value::$variant(v))
                }
            }
        )*
    };
}
value_from!(bool => Bool, u32 => U32, f32 => F32, u64 => U64, Vec2 => Vec2, Vec3 => Vec3);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LocalId(pub(crate) usize);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Label(pub(crate) u32);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct QueryId(pub(crate) usize);

///
/// Built-in values readable by shader stages.
///
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SystemValue {
    LaunchId(u8),
    LaunchSize(u8),
    WorldRayOrigin,
    WorldRayDirection,
    ObjectRayOrigin,
    ObjectRayDirection,
    RayTmin,
    RayTmax,
    IncomingRayFlags,
    CullMask,
    HitT,
    HitKind,
    PrimitiveId,
    InstanceId,
    InstanceCustomIndex,
    GeometryIndex,
    ObjectToWorld(u8),
    WorldToObject(u8),
    ShaderRecordAddress,
}

impl SystemValue {
    pub fn ty(&self) -> VarType {
        match self {
            SystemValue::WorldRayOrigin
            | SystemValue::WorldRayDirection
            | SystemValue::ObjectRayOrigin
            | SystemValue::ObjectRayDirection
            | SystemValue::ObjectToWorld(_)
            | SystemValue::WorldToObject(_) => VarType::Vec3,
            SystemValue::RayTmin | SystemValue::RayTmax | SystemValue::HitT => VarType::F32,
            SystemValue::ShaderRecordAddress => VarType::U64,
            _ => VarType::U32,
        }
    }
    /// Values that stay constant for the whole lane and need no saving
    /// across calls.
    pub fn is_lane_constant(&self) -> bool {
        matches!(self, SystemValue::LaunchId(_) | SystemValue::LaunchSize(_))
    }
}

///
/// Machine registers of the combined kernel.
/// They are not preserved across calls; stages save what they need in
/// their frame.
///
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Reg {
    /// Tag of the next case to dispatch; 0 ends the lane.
    Idx,
    /// Offset of the caller payload relative to the callee stack pointer.
    Arg,
    StackPtr,
    Visited,
    Hit,
    DispatchIdx,
    ShaderRecord,

    Accel,
    RayFlags,
    CullMask,
    SbtOffset,
    SbtStride,
    MissIndex,
    Origin,
    Tmin,
    Dir,
    Tmax,

    PrimitiveId,
    GeometryIndex,
    InstanceAddr,
    HitKind,
    ObjectOrigin,
    ObjectDir,

    CandT,
    CandHitKind,
    CandPrimitiveId,
    CandGeometryIndex,
    CandInstanceAddr,
    CandOpaque,
    CandSbtIdx,
    CandObjectOrigin,
    CandObjectDir,
    AhitAccept,
    AhitTerminate,

    QueryStatus,
}

impl Reg {
    pub const ALL: [Reg; 35] = [
        Reg::Idx,
        Reg::Arg,
        Reg::StackPtr,
        Reg::Visited,
        Reg::Hit,
        Reg::DispatchIdx,
        Reg::ShaderRecord,
        Reg::Accel,
        Reg::RayFlags,
        Reg::CullMask,
        Reg::SbtOffset,
        Reg::SbtStride,
        Reg::MissIndex,
        Reg::Origin,
        Reg::Tmin,
        Reg::Dir,
        Reg::Tmax,
        Reg::PrimitiveId,
        Reg::GeometryIndex,
        Reg::InstanceAddr,
        Reg::HitKind,
        Reg::ObjectOrigin,
        Reg::ObjectDir,
        Reg::CandT,
        Reg::CandHitKind,
        Reg::CandPrimitiveId,
        Reg::CandGeometryIndex,
        Reg::CandInstanceAddr,
        Reg::CandOpaque,
        Reg::CandSbtIdx,
        Reg::CandObjectOrigin,
        Reg::CandObjectDir,
        Reg::AhitAccept,
        Reg::AhitTerminate,
        Reg::QueryStatus,
    ];

    pub fn ty(&self) -> VarType {
        match self {
            Reg::Visited | Reg::Hit | Reg::CandOpaque | Reg::AhitAccept | Reg::AhitTerminate => {
                VarType::Bool
            }
            Reg::QueryStatus => VarType::Bool,
            Reg::ShaderRecord | Reg::Accel | Reg::InstanceAddr | Reg::CandInstanceAddr => {
                VarType::U64
            }
            Reg::Origin
            | Reg::Dir
            | Reg::ObjectOrigin
            | Reg::ObjectDir
            | Reg::CandObjectOrigin
            | Reg::CandObjectDir => VarType::Vec3,
            Reg::Tmin | Reg::Tmax | Reg::CandT => VarType::F32,
            _ => VarType::U32,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum Expr {
    Lit(Value),
    Local(LocalId),
    Reg(Reg),
    System(SystemValue),
    Unary(UnOp, Box<Expr>),
    Binary(BinOp, Box<Expr>, Box<Expr>),
    Select(Box<Expr>, Box<Expr>, Box<Expr>),
    /// Builds a vector from two or three `F32` components.
    Construct(Vec<Expr>),
    Extract(Box<Expr>, u8),
    LoadGlobal(VarType, Box<Expr>),
    /// Reads the stage's own frame at a fixed offset.
    LoadFrame(VarType, u32),
    /// Reads lane scratch memory at an absolute offset.
    LoadScratch(VarType, Box<Expr>),
    LoadPayload(VarType, u32),
    LoadHitAttrib(VarType, u32),
    InstanceField(InstanceField, Box<Expr>),
    RayQueryLoad {
        query: QueryId,
        index: Box<Expr>,
        value: QueryValue,
        committed: bool,
    },
}

macro_rules! binops {
    ($($name:ident => $op:ident),*) => {
        $(
            pub fn $name(self, rhs: impl Into<Expr>) -> Expr {
                Expr::Binary(BinOp::$op, Box::new(self), Box::new(rhs.into()))
            }
        )*
    };
}
macro_rules! unops {
    ($($name:ident => $op:ident),*) => {
        $(
            pub fn $name(self) -> Expr {
                Expr::Unary(UnOp::$op, Box::new(self))
            }
        )*
    };
}

impl Expr {
    pub fn lit(v: impl Into<Value>) -> Self {
        Expr::Lit(v.into())
    }
    pub fn local(id: LocalId) -> Self {
        Expr::Local(id)
    }
    pub fn reg(reg: Reg) -> Self {
        Expr::Reg(reg)
    }
    pub fn sys(value: SystemValue) -> Self {
        Expr::System(value)
    }
    pub fn vec3(x: impl Into<Expr>, y: impl Into<Expr>, z: impl Into<Expr>) -> Self {
        Expr::Construct(vec![x.into(), y.into(), z.into()])
    }
    pub fn vec2(x: impl Into<Expr>, y: impl Into<Expr>) -> Self {
        Expr::Construct(vec![x.into(), y.into()])
    }
    pub fn select(cond: impl Into<Expr>, a: impl Into<Expr>, b: impl Into<Expr>) -> Self {
        Expr::Select(
            Box::new(cond.into()),
            Box::new(a.into()),
            Box::new(b.into()),
        )
    }
    pub fn load_global(ty: VarType, addr: impl Into<Expr>) -> Self {
        Expr::LoadGlobal(ty, Box::new(addr.into()))
    }
    pub fn load_scratch(ty: VarType, offset: impl Into<Expr>) -> Self {
        Expr::LoadScratch(ty, Box::new(offset.into()))
    }
    pub fn extract(self, i: u8) -> Self {
        Expr::Extract(Box::new(self), i)
    }
    pub fn x(self) -> Self {
        self.extract(0)
    }
    pub fn y(self) -> Self {
        self.extract(1)
    }
    pub fn z(self) -> Self {
        self.extract(2)
    }

    binops!(
        add => Add, sub => Sub, mul => Mul, div => Div, rem => Rem,
        min => Min, max => Max,
        and => And, or => Or, xor => Xor, shl => Shl, shr => Shr,
        eq => Eq, ne => Ne, lt => Lt, le => Le, gt => Gt, ge => Ge,
        dot => Dot, cross => Cross
    );
    unops!(
        not => Not, neg => Neg, abs => Abs, sqrt => Sqrt, rcp => Rcp, floor => Floor,
        length => Length, normalize => Normalize,
        to_f32 => ToF32, to_u32 => ToU32, to_u64 => ToU64
    );

    /// Calls `f` on every direct sub-expression.
    pub fn for_each_child(&self, mut f: impl FnMut(&Expr)) {
        match self {
            Expr::Unary(_, a) | Expr::Extract(a, _) | Expr::LoadGlobal(_, a) => f(a),
            Expr::LoadScratch(_, a) | Expr::InstanceField(_, a) => f(a),
            Expr::RayQueryLoad { index, .. } => f(index),
            Expr::Binary(_, a, b) => {
                f(a);
                f(b);
            }
            Expr::Select(c, a, b) => {
                f(c);
                f(a);
                f(b);
            }
            Expr::Construct(elems) => elems.iter().for_each(f),
            _ => {}
        }
    }
}

impl From<LocalId> for Expr {
    fn from(id: LocalId) -> Self {
        Expr::Local(id)
    }
}
impl From<SystemValue> for Expr {
    fn from(value: SystemValue) -> Self {
        Expr::System(value)
    }
}
impl From<Reg> for Expr {
    fn from(reg: Reg) -> Self {
        Expr::Reg(reg)
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct TraceRay {
    pub accel: Expr,
    pub flags: Expr,
    pub cull_mask: Expr,
    pub sbt_offset: Expr,
    pub sbt_stride: Expr,
    pub miss_index: Expr,
    pub origin: Expr,
    pub tmin: Expr,
    pub dir: Expr,
    pub tmax: Expr,
    /// Frame offset of the payload passed to the invoked stages.
    pub payload: u32,
}

impl TraceRay {
    pub fn new(
        accel: impl Into<Expr>,
        origin: impl Into<Expr>,
        dir: impl Into<Expr>,
        payload: u32,
    ) -> Self {
        Self {
            accel: accel.into(),
            flags: Expr::lit(0u32),
            cull_mask: Expr::lit(0xffu32),
            sbt_offset: Expr::lit(0u32),
            sbt_stride: Expr::lit(1u32),
            miss_index: Expr::lit(0u32),
            origin: origin.into(),
            tmin: Expr::lit(0f32),
            dir: dir.into(),
            tmax: Expr::lit(f32::INFINITY),
            payload,
        }
    }
    pub fn flags(mut self, flags: impl Into<Expr>) -> Self {
        self.flags = flags.into();
        self
    }
    pub fn cull_mask(mut self, mask: impl Into<Expr>) -> Self {
        self.cull_mask = mask.into();
        self
    }
    pub fn sbt(
        mut self,
        offset: impl Into<Expr>,
        stride: impl Into<Expr>,
        miss_index: impl Into<Expr>,
    ) -> Self {
        self.sbt_offset = offset.into();
        self.sbt_stride = stride.into();
        self.miss_index = miss_index.into();
        self
    }
    pub fn range(mut self, tmin: impl Into<Expr>, tmax: impl Into<Expr>) -> Self {
        self.tmin = tmin.into();
        self.tmax = tmax.into();
        self
    }
    pub fn operands(&self) -> [&Expr; 10] {
        [
            &self.accel,
            &self.flags,
            &self.cull_mask,
            &self.sbt_offset,
            &self.sbt_stride,
            &self.miss_index,
            &self.origin,
            &self.tmin,
            &self.dir,
            &self.tmax,
        ]
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum QueryOp {
    Initialize {
        accel: Expr,
        flags: Expr,
        cull_mask: Expr,
        origin: Expr,
        tmin: Expr,
        dir: Expr,
        tmax: Expr,
    },
    /// Writes whether the query is still incomplete to [`Reg::QueryStatus`].
    Proceed,
    Confirm,
    Generate(Expr),
    Terminate,
}

/// Operations inserted by the compiler around candidate hits.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Intrinsic {
    /// Saves the committed hit attributes and exposes the candidate ones.
    StageHitAttribs,
    RestoreHitAttribs,
    /// Copies the candidate registers to the committed ones.
    CommitCandidate,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Case {
    pub tag: u32,
    pub label: Label,
    pub body: Vec<Stmt>,
}

///
/// Candidate handling code executed during traversal, selected by the
/// hit group's second handle word.
///
#[derive(Clone, Debug, Default, PartialEq)]
pub struct TraversalBlock {
    pub any_hit: Vec<Case>,
    pub intersection: Vec<Case>,
}

#[derive(Clone, Debug, PartialEq)]
pub enum Stmt {
    Assign(LocalId, Expr),
    StoreGlobal {
        addr: Expr,
        value: Expr,
    },
    StoreFrame {
        offset: u32,
        value: Expr,
    },
    StoreScratch {
        offset: Expr,
        value: Expr,
    },
    StorePayload {
        offset: u32,
        value: Expr,
    },
    StoreHitAttrib {
        offset: u32,
        value: Expr,
    },
    StoreCandidateAttrib {
        offset: u32,
        value: Expr,
    },
    If {
        cond: Expr,
        then: Vec<Stmt>,
        otherwise: Vec<Stmt>,
    },
    Loop(Vec<Stmt>),
    Break,
    Continue,
    Return,
    TraceRay(TraceRay),
    ExecuteCallable {
        sbt_index: Expr,
        payload: u32,
    },
    ReportIntersection {
        t: Expr,
        hit_kind: Expr,
        accepted: Option<LocalId>,
    },
    IgnoreIntersection,
    TerminateRay,
    RayQuery {
        query: QueryId,
        index: Expr,
        op: QueryOp,
    },

    SetReg(Reg, Expr),
    /// Loads the first handle word of a record into [`Reg::Idx`].
    LoadSbtEntry {
        kind: SbtKind,
        index: Expr,
    },
    Intrinsic(Intrinsic),
    Region {
        label: Label,
        body: Vec<Stmt>,
    },
    Exit(Label),
    Traverse(Box<TraversalBlock>),
}

impl Stmt {
    /// Calls `f` on every nested statement block.
    pub fn for_each_block(&self, mut f: impl FnMut(&[Stmt])) {
        match self {
            Stmt::If {
                then, otherwise, ..
            } => {
                f(then);
                f(otherwise);
            }
            Stmt::Loop(body) | Stmt::Region { body, .. } => f(body),
            _ => {}
        }
    }
    /// Calls `f` on every expression operand of this statement, not
    /// descending into nested blocks.
    pub fn for_each_expr(&self, mut f: impl FnMut(&Expr)) {
        match self {
            Stmt::Assign(_, e) | Stmt::SetReg(_, e) => f(e),
            Stmt::StoreGlobal { addr, value } => {
                f(addr);
                f(value);
            }
            Stmt::StoreScratch { offset, value } => {
                f(offset);
                f(value);
            }
            Stmt::StoreFrame { value, .. }
            | Stmt::StorePayload { value, .. }
            | Stmt::StoreHitAttrib { value, .. }
            | Stmt::StoreCandidateAttrib { value, .. } => f(value),
            Stmt::If { cond, .. } => f(cond),
            Stmt::TraceRay(trace) => trace.operands().into_iter().for_each(f),
            Stmt::ExecuteCallable { sbt_index, .. } => f(sbt_index),
            Stmt::ReportIntersection { t, hit_kind, .. } => {
                f(t);
                f(hit_kind);
            }
            Stmt::RayQuery { index, op, .. } => {
                f(index);
                match op {
                    QueryOp::Initialize {
                        accel,
                        flags,
                        cull_mask,
                        origin,
                        tmin,
                        dir,
                        tmax,
                    } => [accel, flags, cull_mask, origin, tmin, dir, tmax]
                        .into_iter()
                        .for_each(f),
                    QueryOp::Generate(t) => f(t),
                    _ => {}
                }
            }
            Stmt::LoadSbtEntry { index, .. } => f(index),
            _ => {}
        }
    }
    pub fn contains_call(&self) -> bool {
        match self {
            Stmt::TraceRay(_) | Stmt::ExecuteCallable { .. } => true,
            _ => {
                let mut found = false;
                self.for_each_block(|block| found |= block.iter().any(Stmt::contains_call));
                found
            }
        }
    }
}

///
/// Builds the body of one shader stage.
///
/// Structured control flow is expressed through closures:
/// ```ignore
/// let mut b = ShaderBuilder::new(StageKind::RayGen, "raygen");
/// let i = b.let_(VarType::U32, 0u32);
/// b.loop_(|b| {
///     b.if_(Expr::local(i).ge(4u32), |b| b.break_());
///     b.assign(i, Expr::local(i).add(1u32));
/// });
/// ```
///
#[derive(Debug)]
pub struct ShaderBuilder {
    kind: StageKind,
    name: String,
    locals: Vec<VarType>,
    scratch_size: u32,
    queries: Vec<u32>,
    blocks: Vec<Vec<Stmt>>,
}

impl ShaderBuilder {
    pub fn new(kind: StageKind, name: impl Into<String>) -> Self {
        Self {
            kind,
            name: name.into(),
            locals: vec![],
            scratch_size: 0,
            queries: vec![],
            blocks: vec![vec![]],
        }
    }
    pub fn local(&mut self, ty: VarType) -> LocalId {
        self.locals.push(ty);
        LocalId(self.locals.len() - 1)
    }
    pub fn let_(&mut self, ty: VarType, init: impl Into<Expr>) -> LocalId {
        let id = self.local(ty);
        self.assign(id, init);
        id
    }
    /// Reserves `size` bytes of frame memory, e.g. for a payload, and
    /// returns their frame offset.
    pub fn scratch(&mut self, size: u32) -> u32 {
        let offset = self.scratch_size;
        self.scratch_size += (size + 3) & !3;
        offset
    }
    pub fn ray_query(&mut self, len: u32) -> QueryId {
        self.queries.push(len.max(1));
        QueryId(self.queries.len() - 1)
    }

    fn current(&mut self) -> &mut Vec<Stmt> {
        // The root block is never popped.
        let last = self.blocks.len() - 1;
        &mut self.blocks[last]
    }
    pub fn push(&mut self, stmt: Stmt) {
        self.current().push(stmt);
    }
    fn block(&mut self, f: impl FnOnce(&mut Self)) -> Vec<Stmt> {
        self.blocks.push(vec![]);
        f(self);
        self.blocks.pop().unwrap_or_default()
    }

    pub fn assign(&mut self, id: LocalId, value: impl Into<Expr>) {
        self.push(Stmt::Assign(id, value.into()));
    }
    pub fn store_global(&mut self, addr: impl Into<Expr>, value: impl Into<Expr>) {
        self.push(Stmt::StoreGlobal {
            addr: addr.into(),
            value: value.into(),
        });
    }
    pub fn store_frame(&mut self, offset: u32, value: impl Into<Expr>) {
        self.push(Stmt::StoreFrame {
            offset,
            value: value.into(),
        });
    }
    pub fn store_payload(&mut self, offset: u32, value: impl Into<Expr>) {
        self.push(Stmt::StorePayload {
            offset,
            value: value.into(),
        });
    }
    pub fn store_hit_attrib(&mut self, offset: u32, value: impl Into<Expr>) {
        self.push(Stmt::StoreHitAttrib {
            offset,
            value: value.into(),
        });
    }
    pub fn if_(&mut self, cond: impl Into<Expr>, then: impl FnOnce(&mut Self)) {
        self.if_else(cond, then, |_| {});
    }
    pub fn if_else(
        &mut self,
        cond: impl Into<Expr>,
        then: impl FnOnce(&mut Self),
        otherwise: impl FnOnce(&mut Self),
    ) {
        let cond = cond.into();
        let then = self.block(then);
        let otherwise = self.block(otherwise);
        self.push(Stmt::If {
            cond,
            then,
            otherwise,
        });
    }
    pub fn loop_(&mut self, body: impl FnOnce(&mut Self)) {
        let body = self.block(body);
        self.push(Stmt::Loop(body));
    }
    pub fn break_(&mut self) {
        self.push(Stmt::Break);
    }
    pub fn continue_(&mut self) {
        self.push(Stmt::Continue);
    }
    pub fn return_(&mut self) {
        self.push(Stmt::Return);
    }
    pub fn trace_ray(&mut self, trace: TraceRay) {
        self.push(Stmt::TraceRay(trace));
    }
    pub fn execute_callable(&mut self, sbt_index: impl Into<Expr>, payload: u32) {
        self.push(Stmt::ExecuteCallable {
            sbt_index: sbt_index.into(),
            payload,
        });
    }
    /// Returns a local holding whether the intersection was committed.
    pub fn report_intersection(
        &mut self,
        t: impl Into<Expr>,
        hit_kind: impl Into<Expr>,
    ) -> LocalId {
        let accepted = self.local(VarType::Bool);
        self.push(Stmt::ReportIntersection {
            t: t.into(),
            hit_kind: hit_kind.into(),
            accepted: Some(accepted),
        });
        accepted
    }
    pub fn ignore_intersection(&mut self) {
        self.push(Stmt::IgnoreIntersection);
    }
    pub fn terminate_ray(&mut self) {
        self.push(Stmt::TerminateRay);
    }

    pub fn ray_query_op(&mut self, query: QueryId, index: impl Into<Expr>, op: QueryOp) {
        self.push(Stmt::RayQuery {
            query,
            index: index.into(),
            op,
        });
    }
    /// Advances the query and returns a local holding its incomplete flag.
    pub fn ray_query_proceed(&mut self, query: QueryId, index: impl Into<Expr>) -> LocalId {
        self.ray_query_op(query, index, QueryOp::Proceed);
        self.let_(VarType::Bool, Expr::reg(Reg::QueryStatus))
    }

    pub fn build(self) -> Stage {
        let mut blocks = self.blocks;
        Stage {
            kind: self.kind,
            name: self.name,
            body: blocks.swap_remove(0),
            locals: self.locals,
            scratch_size: self.scratch_size,
            queries: self.queries,
        }
    }
}
