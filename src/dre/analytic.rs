//! Squared error against exact optimal twists.

use candle_core::Tensor;

use crate::error::{Error, Result};
use crate::exact::ExactTable;
use crate::scorer::CausalScorer;

/// Mean over prefix lengths of the per-length mean of `(opt - learned)^2`.
///
/// Every length weighs the same regardless of how many prefixes it holds.
/// With `relative`, each length's differences are centered first, since a
/// constant shift of all twists at one length leaves the proposal unchanged.
pub fn analytic_mse_loss(table: &ExactTable, twist_net: &dyn CausalScorer, relative: bool) -> Result<Tensor> {
    let learned = table.model_log_twists(twist_net)?;
    let optimal = table.optimal_log_twists();
    if optimal.is_empty() {
        return Err(Error::InvalidArgument(
            "analytic MSE needs at least two generated tokens".into(),
        ));
    }

    let per_length = optimal
        .iter()
        .zip(learned)
        .map(|(opt, psi)| -> Result<Tensor> {
            let opt = Tensor::from_slice(opt, opt.len(), psi.device())?;
            let mut diff = (opt - psi)?;
            if relative {
                diff = diff.broadcast_sub(&diff.mean_all()?)?;
            }
            Ok(diff.sqr()?.mean_all()?)
        })
        .collect::<Result<Vec<_>>>()?;
    Ok(Tensor::stack(&per_length, 0)?.mean_all()?)
}
