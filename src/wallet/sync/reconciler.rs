//! Derivation of owned outputs from a node's references.
//!
//! For every node in the history, the receive pass records each output paying the node's script,
//! and the spend pass links each such output to the input of a referenced transaction that
//! consumes it.

use crate::wallet::model::Wallet;
use crate::wallet::types::{
    ConsistencyError, NodeHistory, OwnedOutput, OwnedOutputs, ReferenceSet, ResolvedTransaction,
    SpendingInput, WalletNode, WalletSyncError,
};

use bitcoin::OutPoint;
use tracing::debug;

/// Recompute the outputs of every node in the history.
///
/// Returns the nodes whose outputs changed.
pub fn reconcile_wallet(wallet: &mut Wallet, history: &NodeHistory) -> Result<Vec<WalletNode>, WalletSyncError> {
    let mut changed = Vec::new();
    for (node, references) in history {
        let outputs = calculate_node_outputs(wallet, node, references)?;
        if wallet.update_node_outputs(*node, outputs) {
            changed.push(*node);
        }
    }
    if !changed.is_empty() {
        debug!("Outputs changed on {} nodes of {}", changed.len(), wallet.name());
    }
    Ok(changed)
}

pub fn calculate_node_outputs(
    wallet: &Wallet,
    node: &WalletNode,
    references: &ReferenceSet,
) -> Result<OwnedOutputs, WalletSyncError> {
    let script = wallet.output_script(node)?;
    let transactions = wallet.transactions();
    let mut outputs = OwnedOutputs::new();

    for reference in references.iter() {
        let block_tx = match transactions.get(&reference.txid) {
            None => return Err(ConsistencyError::UnresolvedReference(reference.txid).into()),
            Some(ResolvedTransaction::Unfetchable) => {
                return Err(ConsistencyError::UnfetchableReference(reference.txid).into());
            }
            Some(ResolvedTransaction::Fetched(block_tx)) => block_tx,
        };

        for (vout, output) in block_tx.transaction.output.iter().enumerate() {
            if output.script_pubkey != script {
                continue;
            }
            let outpoint = OutPoint::new(reference.txid, vout as u32);
            outputs.entry(outpoint).or_insert_with(|| {
                OwnedOutput::new(outpoint, reference.height, block_tx.block_time, reference.fee, output.value)
            });
        }
    }

    for reference in references.iter() {
        let Some(ResolvedTransaction::Fetched(block_tx)) = transactions.get(&reference.txid) else {
            continue;
        };

        for (input_index, input) in block_tx.transaction.input.iter().enumerate() {
            let previous = input.previous_output;
            if !references.contains(&previous.txid) {
                continue;
            }
            let Some(ResolvedTransaction::Fetched(previous_tx)) = transactions.get(&previous.txid) else {
                continue;
            };
            let Some(spent_output) = previous_tx.transaction.output.get(previous.vout as usize) else {
                continue;
            };
            if spent_output.script_pubkey != script {
                continue;
            }

            let owned = outputs
                .get_mut(&previous)
                .ok_or(ConsistencyError::SpendWithoutReceive(previous))?;
            owned.set_spent_by(SpendingInput {
                txid: reference.txid,
                input_index: input_index as u32,
                height: reference.height,
                block_time: block_tx.block_time,
                fee: reference.fee,
            })?;
        }
    }

    Ok(outputs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{block_transaction_of, external_script, funding_payment, payment, test_wallet, txid};
    use crate::wallet::types::{KeyPurpose, Reference};
    use bitcoin::Amount;

    fn setup() -> (Wallet, WalletNode) {
        let mut wallet = test_wallet(20);
        wallet.fill_to_index(KeyPurpose::Receive, 0);
        (wallet, WalletNode::new(KeyPurpose::Receive, 0))
    }

    #[test]
    fn links_spend_to_received_output() {
        let (mut wallet, node) = setup();
        let funding = funding_payment(wallet.output_script(&node).unwrap(), 50_000, 1);
        let spend = payment(OutPoint::new(funding.compute_txid(), 0), external_script(), 49_000);
        wallet.update_transactions([block_transaction_of(&funding, 100), block_transaction_of(&spend, 0)]);

        let references: ReferenceSet = [
            Reference::new(funding.compute_txid(), 100, None),
            Reference::new(spend.compute_txid(), 0, Some(1_000)),
        ]
        .into_iter()
        .collect();
        let mut history = NodeHistory::new();
        history.insert(node, references);

        let changed = reconcile_wallet(&mut wallet, &history).unwrap();
        assert_eq!(changed, vec![node]);

        let outputs = wallet.node_outputs(&node).unwrap();
        assert_eq!(outputs.len(), 1);
        let output = &outputs[&OutPoint::new(funding.compute_txid(), 0)];
        assert_eq!(output.value, Amount::from_sat(50_000));
        let spent_by = output.spent_by().unwrap();
        assert_eq!(spent_by.txid, spend.compute_txid());
        assert_eq!(spent_by.input_index, 0);
        assert_eq!(spent_by.fee, Some(1_000));
        assert_eq!(wallet.mempool_nodes(), [node].into());

        // Nothing changes the second time
        assert!(reconcile_wallet(&mut wallet, &history).unwrap().is_empty());
    }

    #[test]
    fn rejects_two_spenders_of_one_output() {
        let (mut wallet, node) = setup();
        let funding = funding_payment(wallet.output_script(&node).unwrap(), 50_000, 1);
        let outpoint = OutPoint::new(funding.compute_txid(), 0);
        let first = payment(outpoint, external_script(), 49_000);
        let second = payment(outpoint, external_script(), 48_000);
        wallet.update_transactions([
            block_transaction_of(&funding, 100),
            block_transaction_of(&first, 101),
            block_transaction_of(&second, 101),
        ]);

        let references: ReferenceSet = [&funding, &first, &second]
            .iter()
            .map(|tx| Reference::new(tx.compute_txid(), 100, None))
            .collect();
        let err = calculate_node_outputs(&wallet, &node, &references).unwrap_err();
        assert!(matches!(
            err,
            WalletSyncError::ConsistencyError(ConsistencyError::DoubleSpend { outpoint: o, .. }) if o == outpoint
        ));
    }

    #[test]
    fn unresolved_and_unfetchable_references_are_fatal() {
        let (mut wallet, node) = setup();
        let missing: ReferenceSet = [Reference::new(txid(1), 5, None)].into_iter().collect();
        assert!(matches!(
            calculate_node_outputs(&wallet, &node, &missing),
            Err(WalletSyncError::ConsistencyError(ConsistencyError::UnresolvedReference(_)))
        ));

        wallet.update_transactions([(txid(1), ResolvedTransaction::Unfetchable)]);
        assert!(matches!(
            calculate_node_outputs(&wallet, &node, &missing),
            Err(WalletSyncError::ConsistencyError(ConsistencyError::UnfetchableReference(_)))
        ));
    }

    #[test]
    fn spends_of_foreign_outputs_are_skipped() {
        let (mut wallet, node) = setup();
        // Pays us from an output we never owned and whose funding we do not know
        let incoming = payment(
            crate::testing::external_outpoint(4),
            wallet.output_script(&node).unwrap(),
            12_000,
        );
        wallet.update_transactions([block_transaction_of(&incoming, 30)]);
        let references: ReferenceSet =
            [Reference::new(incoming.compute_txid(), 30, None)].into_iter().collect();

        let outputs = calculate_node_outputs(&wallet, &node, &references).unwrap();
        assert_eq!(outputs.len(), 1);
        assert!(outputs.values().all(|o| !o.is_spent()));
    }
}
