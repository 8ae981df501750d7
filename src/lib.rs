pub mod config;
pub mod decomp;
pub mod dense;
pub mod error;
pub mod linalg;
pub mod parallel;
pub mod storage;
pub mod vectors;
pub mod vectorspace;

pub use config::{TruncationTolerance, VectorSpaceConfig};
pub use decomp::{
    DecompStage, Dmd, DmdDecomp, DmdDecompPaths, Pod, PodDecomp, PodDecompPaths, TlsDmd,
    TlsDmdDecomp, TlsDmdDecompPaths,
};
pub use dense::{DenseOptions, DmdMatrices, PodMatrices, TlsDmdMatrices};
pub use error::{ModalError, Result};
pub use linalg::{CMatrix, CVector};
pub use parallel::{LocalCluster, SingleProcess, Topology};
#[cfg(feature = "mpi")]
pub use parallel::MpiTopology;
pub use storage::{JsonMatrixStorage, MatrixStorage, TextMatrixStorage};
pub use vectors::{
    ArrayVector, Handle, InnerProduct, InnerProductWeights, JsonFileHandle, MemoryHandle,
    OffsetHandle, VecHandle, Vector, WeightedInnerProduct,
};
pub use vectorspace::VectorSpace;
