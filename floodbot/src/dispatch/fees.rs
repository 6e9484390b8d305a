//! Fee selection helpers shared by the engine and the account pool.

// Third party imports
use ethers::types::{transaction::eip2718::TypedTransaction, U256};

// Internal imports
use flood_blockchain::Endpoint;
use flood_common::{error::FloodResult, units::gwei_to_wei};

/// Ceiling applied to funding transaction fees
pub const FUNDING_FEE_CEILING_GWEI: f64 = 100.0;

/// Fee cap and tip for a new transaction.
///
/// Explicit gwei values override the endpoint's suggestion. The cap never drops
/// below the latest base fee and the tip never exceeds the cap.
pub async fn suggested_fees(
    endpoint: &Endpoint,
    base_fee_gwei: Option<f64>,
    tip_fee_gwei: Option<f64>,
) -> FloodResult<(U256, U256)> {
    let snapshot = endpoint.fee_snapshot().await?;
    let explicit = |gwei: Option<f64>| gwei.filter(|g| *g > 0.0).map(gwei_to_wei);

    let fee_cap = explicit(base_fee_gwei)
        .unwrap_or(snapshot.gas_price)
        .max(snapshot.base_fee);
    let tip = explicit(tip_fee_gwei).unwrap_or(snapshot.tip).min(fee_cap);
    Ok((fee_cap, tip))
}

/// Fills fee fields the caller left empty
pub fn apply_fees(tx: &mut TypedTransaction, fee_cap: U256, tip: U256) {
    match tx {
        TypedTransaction::Eip1559(inner) => {
            if inner.max_fee_per_gas.is_none() {
                inner.max_fee_per_gas = Some(fee_cap);
            }
            if inner.max_priority_fee_per_gas.is_none() {
                inner.max_priority_fee_per_gas = Some(tip.min(inner.max_fee_per_gas.unwrap_or(fee_cap)));
            }
        }
        _ => {
            if tx.gas_price().is_none() {
                tx.set_gas_price(fee_cap);
            }
        }
    }
}

/// Overwrites the fee fields, used when a node rejected the previous ones
pub fn replace_fees(tx: &mut TypedTransaction, fee_cap: U256, tip: U256) {
    match tx {
        TypedTransaction::Eip1559(inner) => {
            inner.max_fee_per_gas = Some(fee_cap);
            inner.max_priority_fee_per_gas = Some(tip.min(fee_cap));
        }
        _ => {
            tx.set_gas_price(fee_cap);
        }
    }
}

/// Current fee cap and tip of a transaction, the gas price twice for legacy ones
pub fn fees_of(tx: &TypedTransaction) -> (U256, U256) {
    match tx {
        TypedTransaction::Eip1559(inner) => {
            let cap = inner.max_fee_per_gas.unwrap_or_default();
            (cap, inner.max_priority_fee_per_gas.unwrap_or(cap))
        }
        _ => {
            let price = tx.gas_price().unwrap_or_default();
            (price, price)
        }
    }
}

/// Fees for root funding transactions: capped at 100 gwei, otherwise padded
/// by 2 gwei (cap) and 0.1 gwei (tip) so they land promptly.
pub fn funding_fees(fee_cap: U256, tip: U256) -> (U256, U256) {
    let ceiling = gwei_to_wei(FUNDING_FEE_CEILING_GWEI);
    let fee_cap = if fee_cap > ceiling { ceiling } else { fee_cap + gwei_to_wei(2.0) };
    let tip = if tip > ceiling { ceiling } else { tip + gwei_to_wei(0.1) };
    (fee_cap, tip.min(fee_cap))
}

/// Fees for sweeping a child back to the root: tip equals the padded cap
pub fn reclaim_fees(fee_cap: U256) -> (U256, U256) {
    let fee_cap = fee_cap + gwei_to_wei(1.0);
    (fee_cap, fee_cap)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ethers::types::{Address, Eip1559TransactionRequest, TransactionRequest};
    use flood_blockchain::testing::MockChain;

    fn gwei(value: f64) -> U256 {
        gwei_to_wei(value)
    }

    #[tokio::test]
    async fn test_suggested_fees_from_network() {
        let chain = MockChain::new(1);
        let endpoint = Endpoint::new(0, "http://a".parse().unwrap(), chain.client());
        let (cap, tip) = suggested_fees(&endpoint, None, None).await.unwrap();
        assert_eq!(cap, gwei(2.0));
        assert_eq!(tip, gwei(1.0));
    }

    #[tokio::test]
    async fn test_suggested_fees_overrides_are_clamped() {
        let chain = MockChain::new(1);
        chain.set_base_fee(gwei(5.0));
        let endpoint = Endpoint::new(0, "http://a".parse().unwrap(), chain.client());

        let (cap, tip) = suggested_fees(&endpoint, Some(3.0), Some(8.0)).await.unwrap();
        assert_eq!(cap, gwei(5.0));
        assert_eq!(tip, gwei(5.0));

        let (cap, tip) = suggested_fees(&endpoint, Some(20.0), Some(0.5)).await.unwrap();
        assert_eq!(cap, gwei(20.0));
        assert_eq!(tip, gwei(0.5));
    }

    #[test]
    fn test_apply_fees_keeps_explicit_values() {
        let mut tx: TypedTransaction = Eip1559TransactionRequest::new()
            .to(Address::zero())
            .max_fee_per_gas(gwei(50.0))
            .into();
        apply_fees(&mut tx, gwei(10.0), gwei(2.0));
        assert_eq!(fees_of(&tx), (gwei(50.0), gwei(2.0)));

        let mut legacy: TypedTransaction = TransactionRequest::new().to(Address::zero()).into();
        apply_fees(&mut legacy, gwei(10.0), gwei(2.0));
        assert_eq!(legacy.gas_price(), Some(gwei(10.0)));
    }

    #[test]
    fn test_replace_fees_bounds_tip() {
        let mut tx: TypedTransaction = Eip1559TransactionRequest::new().into();
        replace_fees(&mut tx, gwei(3.0), gwei(4.0));
        assert_eq!(fees_of(&tx), (gwei(3.0), gwei(3.0)));
    }

    #[test]
    fn test_funding_fees() {
        assert_eq!(funding_fees(gwei(10.0), gwei(1.0)), (gwei(12.0), gwei(1.1)));
        assert_eq!(funding_fees(gwei(150.0), gwei(120.0)), (gwei(100.0), gwei(100.0)));
        assert_eq!(funding_fees(gwei(1.0), gwei(50.0)), (gwei(3.0), gwei(3.0)));
    }

    #[test]
    fn test_reclaim_fees() {
        assert_eq!(reclaim_fees(gwei(2.0)), (gwei(3.0), gwei(3.0)));
    }
}
