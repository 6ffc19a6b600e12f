use crate::error::JobError;

/// A loaded model that must never run two inferences at once.
///
/// Implementations own whatever native context the model needs. The gate
/// hands out `&mut self`, so `infer` may freely mutate internal state.
pub trait InferenceModel: Send + 'static {
    type Input;
    type Output;

    fn infer(&mut self, input: Self::Input) -> Result<Self::Output, JobError>;

    /// Release native memory. Called at most once per loaded instance.
    fn unload(&mut self) -> anyhow::Result<()> {
        Ok(())
    }

    fn approx_memory_mb(&self) -> Option<f64> {
        None
    }
}
