use rand::{rngs::StdRng, Rng, SeedableRng};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;
use std::collections::BTreeMap;
use std::fmt;
use tracing::{debug, info, trace};

use crate::desc::Component;
use crate::*;

/// How word weights are computed at build time and applied at transform time.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WeightingType {
    /// Count normalized by number of descriptors, times `ln(N / N_i)`.
    TfIdf,
    /// Count normalized by number of descriptors, word weight 1.
    Tf,
    /// Presence times `ln(N / N_i)`, so repeated features do not add weight.
    Idf,
    /// Presence only, word weight 1, no normalization.
    Binary,
}

impl Default for WeightingType {
    fn default() -> Self {
        WeightingType::TfIdf
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
/// Parameters for building a vocabulary.
pub struct VocabParams {
    /// Branching factor.
    pub k: usize,
    /// Max number of levels below the root.
    pub levels: usize,
    pub weighting: WeightingType,
    pub scoring: ScoringType,
    /// Seed for k-means++ initialization. Same seed and data, same tree.
    pub seed: u64,
    /// Cap on Lloyd iterations per k-means step.
    pub max_iterations: usize,
}

impl Default for VocabParams {
    fn default() -> Self {
        Self {
            k: 10,
            levels: 5,
            weighting: WeightingType::TfIdf,
            scoring: ScoringType::L1Norm,
            seed: 0,
            max_iterations: 100,
        }
    }
}

impl VocabParams {
    pub fn new(k: usize, levels: usize) -> Self {
        Self {
            k,
            levels,
            ..Self::default()
        }
    }

    pub fn weighting(mut self, weighting: WeightingType) -> Self {
        self.weighting = weighting;
        self
    }

    pub fn scoring(mut self, scoring: ScoringType) -> Self {
        self.scoring = scoring;
        self
    }

    pub fn seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    pub fn max_iterations(mut self, n: usize) -> Self {
        self.max_iterations = n;
        self
    }

    pub fn validate(&self) -> BowResult<()> {
        if self.k < 2 {
            return Err(BowErr::InvalidParams(format!(
                "branching factor must be at least 2, got {}",
                self.k
            )));
        }
        if self.levels == 0 {
            return Err(BowErr::InvalidParams("levels must be at least 1".into()));
        }
        if self.max_iterations == 0 {
            return Err(BowErr::InvalidParams(
                "max_iterations must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

#[derive(Serialize, Deserialize, PartialEq, Clone)]
/// Feature vocabulary built from a collection of image keypoint descriptors. Can be:
/// 1. Created.
/// 2. Saved to a file & loaded from a file (requires bincode feature, enabled by default).
/// 3. Used to transform a new set of descriptors into a BoW representation (and
///    optionally get a direct index from features to nodes).
///
/// A vocabulary is immutable once built, so `transform` and `score` may be
/// called from many threads at once (share it behind an `Arc`).
pub struct Vocabulary {
    params: VocabParams,
    tree: Option<Tree>,
}

/// Vocabulary API
impl Vocabulary {
    /// An unbuilt vocabulary. `transform` fails until `build` or `load`.
    pub fn new(params: VocabParams) -> Self {
        Self { params, tree: None }
    }

    /// Build a vocabulary from a collection of descriptors.
    pub fn create(features: &Descriptors, params: VocabParams) -> BowResult<Self> {
        let mut v = Self::new(params);
        v.build(features)?;
        Ok(v)
    }

    /// (Re)build the tree with recursive k-means clustering of `features`.
    /// Blocks until the whole tree and all weights are final.
    pub fn build(&mut self, features: &Descriptors) -> BowResult<()> {
        self.params.validate()?;
        if features.is_empty() {
            return Err(BowErr::EmptyTrainingSet);
        }
        info!(
            features = features.len(),
            kind = %features.kind(),
            k = self.params.k,
            levels = self.params.levels,
            "building vocabulary"
        );
        let tree = match features {
            Descriptors::Binary(m) => Tree::build(m, &self.params),
            Descriptors::Float(m) => Tree::build(m, &self.params),
        };
        info!(
            words = tree.words.len(),
            nodes = tree.nodes.len(),
            "vocabulary built"
        );
        self.tree = Some(tree);
        Ok(())
    }

    /// Transform a set of descriptors into its bag of words representation
    /// with respect to the Vocabulary. The result is l1 normalized unless the
    /// weighting is [`WeightingType::Binary`].
    pub fn transform(&self, features: &Descriptors) -> BowResult<BoW> {
        self.transform_generic(features, None).map(|(bow, _)| bow)
    }

    /// Like [`transform`](Self::transform), but also provides the "direct
    /// index" from features to nodes `levels_up` levels above the leaves
    /// they reach.
    pub fn transform_with_direct_idx(
        &self,
        features: &Descriptors,
        levels_up: usize,
    ) -> BowResult<(BoW, FeatureVector)> {
        self.transform_generic(features, Some(levels_up))
    }

    /// Word the single descriptor `desc` falls into.
    pub fn word_of(&self, desc: DescRef<'_>) -> BowResult<WordId> {
        let tree = self.tree()?;
        tree.check_kind(desc.kind())?;
        Ok(tree.word_at(tree.descend_ref(desc)))
    }

    /// Score two bow vectors with the configured scoring type.
    pub fn score(&self, a: &BoW, b: &BoW) -> BowResult<f64> {
        self.tree()?;
        Ok(self.params.scoring.score(a, b))
    }

    /// Weight stored for `word`.
    pub fn word_weight(&self, word: WordId) -> Option<f64> {
        let tree = self.tree.as_ref()?;
        let node = *tree.words.get(word as usize)?;
        Some(tree.nodes[node as usize].weight)
    }

    /// Ancestor of `word`'s leaf `levels_up` levels above it, clamped to the root.
    pub fn parent_node(&self, word: WordId, levels_up: usize) -> Option<NodeId> {
        let tree = self.tree.as_ref()?;
        let mut id = *tree.words.get(word as usize)?;
        for _ in 0..levels_up {
            if id == 0 {
                break;
            }
            id = tree.nodes[id as usize].parent;
        }
        Some(id)
    }

    /// Number of words. Zero when unbuilt.
    pub fn size(&self) -> usize {
        self.tree.as_ref().map_or(0, |t| t.words.len())
    }

    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }

    /// Number of nodes, root included.
    pub fn num_nodes(&self) -> usize {
        self.tree.as_ref().map_or(0, |t| t.nodes.len())
    }

    /// Descriptor kind the vocabulary was built for.
    pub fn kind(&self) -> Option<DescKind> {
        self.tree.as_ref().map(|t| t.kind)
    }

    pub fn metric(&self) -> Option<DescriptorMetric> {
        self.tree.as_ref().map(|t| t.metric)
    }

    pub fn params(&self) -> &VocabParams {
        &self.params
    }

    pub fn weighting(&self) -> WeightingType {
        self.params.weighting
    }

    pub fn scoring(&self) -> ScoringType {
        self.params.scoring
    }

    /// Discard the tree. Parameters are kept for the next `build`.
    pub fn clear(&mut self) {
        self.tree = None;
    }
}

/// Persistence
#[cfg(feature = "bincode")]
impl Vocabulary {
    /// Load a vocabulary from a file
    pub fn load<P: AsRef<std::path::Path>>(file: P) -> BowResult<Self> {
        let file = std::fs::File::open(file)?;
        Self::read_from(std::io::BufReader::new(file))
    }

    /// Load a vocabulary from a file, rejecting it unless it was built for
    /// descriptors of `kind`.
    pub fn load_expecting<P: AsRef<std::path::Path>>(file: P, kind: DescKind) -> BowResult<Self> {
        let voc = Self::load(file)?;
        match voc.kind() {
            Some(k) if k == kind => Ok(voc),
            Some(k) => Err(BowErr::CorruptOrIncompatibleVocabulary(format!(
                "vocabulary was built for {}, expected {}",
                k, kind
            ))),
            None => Err(BowErr::VocabularyNotBuilt),
        }
    }

    /// Save vocabulary to a file
    pub fn save<P: AsRef<std::path::Path>>(&self, file: P) -> BowResult<()> {
        let file = std::fs::File::create(file)?;
        let mut w = std::io::BufWriter::new(file);
        self.write_to(&mut w)?;
        std::io::Write::flush(&mut w)?;
        Ok(())
    }

    pub fn write_to<W: std::io::Write>(&self, w: W) -> BowResult<()> {
        let tree = self.tree()?;
        let artifact = VocabArtifactRef {
            magic: VOCAB_MAGIC,
            version: VOCAB_VERSION,
            params: &self.params,
            tree,
        };
        bincode::serialize_into(w, &artifact)?;
        info!(words = tree.words.len(), "vocabulary saved");
        Ok(())
    }

    pub fn read_from<R: std::io::Read>(r: R) -> BowResult<Self> {
        let corrupt = BowErr::CorruptOrIncompatibleVocabulary;
        let artifact: VocabArtifact =
            bincode::deserialize_from(r).map_err(|e| corrupt(e.to_string()))?;
        if artifact.magic != VOCAB_MAGIC {
            return Err(corrupt("not a vocabulary artifact".into()));
        }
        if artifact.version != VOCAB_VERSION {
            return Err(corrupt(format!(
                "unsupported format version {}",
                artifact.version
            )));
        }
        artifact
            .params
            .validate()
            .map_err(|e| corrupt(e.to_string()))?;
        artifact
            .tree
            .validate(artifact.params.levels)
            .map_err(corrupt)?;
        info!(words = artifact.tree.words.len(), "vocabulary loaded");
        Ok(Self {
            params: artifact.params,
            tree: Some(artifact.tree),
        })
    }
}

/////////////////////                Helpers                 ////////////////////////
/////////////////////////////////////////////////////////////////////////////////////

#[cfg(feature = "bincode")]
const VOCAB_MAGIC: [u8; 4] = *b"VBOW";
#[cfg(feature = "bincode")]
const VOCAB_VERSION: u32 = 1;

#[cfg(feature = "bincode")]
#[derive(Serialize)]
struct VocabArtifactRef<'a> {
    magic: [u8; 4],
    version: u32,
    params: &'a VocabParams,
    tree: &'a Tree,
}

#[cfg(feature = "bincode")]
#[derive(Deserialize)]
struct VocabArtifact {
    magic: [u8; 4],
    version: u32,
    params: VocabParams,
    tree: Tree,
}

#[derive(Serialize, Deserialize, PartialEq, Clone)]
/// Node arena. Node 0 is the root; node `i`'s centroid is row `i` of
/// `centroids`. Leaves are the nodes without children.
struct Tree {
    kind: DescKind,
    metric: DescriptorMetric,
    nodes: Vec<Node>,
    centroids: Descriptors,
    /// Word id -> leaf node.
    words: Vec<NodeId>,
    levels: usize,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
struct Node {
    parent: NodeId,
    depth: usize,
    children: Vec<NodeId>,
    word: Option<WordId>,
    /// Word weight. Only meaningful for leaves.
    weight: f64,
    /// Number of training descriptors that reached this node.
    cluster_size: usize,
}

impl Node {
    fn new(parent: NodeId, depth: usize, cluster_size: usize) -> Self {
        Self {
            parent,
            depth,
            children: Vec::new(),
            word: None,
            weight: 0.,
            cluster_size,
        }
    }

    fn is_leaf(&self) -> bool {
        self.children.is_empty()
    }
}

/// Result of one k-means step: a child centroid and the training rows under it.
struct Cluster<T> {
    centroid: Vec<T>,
    members: Vec<usize>,
}

type Path = SmallVec<[NodeId; 8]>;

impl Vocabulary {
    fn tree(&self) -> BowResult<&Tree> {
        self.tree.as_ref().ok_or(BowErr::VocabularyNotBuilt)
    }

    fn transform_generic(
        &self,
        features: &Descriptors,
        levels_up: Option<usize>,
    ) -> BowResult<(BoW, FeatureVector)> {
        let tree = self.tree()?;
        let mut direct_idx = FeatureVector::new();
        if features.is_empty() {
            return Ok((BoW::new(), direct_idx));
        }
        tree.check_kind(features.kind())?;

        let di = levels_up.map(|up| (up, &mut direct_idx));
        let leaves = match features {
            Descriptors::Binary(m) => tree.descend_all(m, di)?,
            Descriptors::Float(m) => tree.descend_all(m, di)?,
        };

        let mut counts: BTreeMap<WordId, usize> = BTreeMap::new();
        for leaf in leaves {
            *counts.entry(tree.word_at(leaf)).or_insert(0) += 1;
        }

        let n = features.len() as f64;
        let weighting = self.params.weighting;
        let mut bow: BoW = counts
            .into_iter()
            .map(|(word, count)| {
                let weight = tree.nodes[tree.words[word as usize] as usize].weight;
                let tf = match weighting {
                    WeightingType::TfIdf | WeightingType::Tf => count as f64 / n,
                    WeightingType::Idf | WeightingType::Binary => 1.,
                };
                (word, tf * weight)
            })
            .collect();
        if weighting != WeightingType::Binary {
            bow.normalize_l1();
        }

        Ok((bow, direct_idx))
    }
}

impl Tree {
    fn build<T: Component>(features: &Matrix<T>, params: &VocabParams) -> Self {
        let width = features.width();
        let mut nodes = vec![Node::new(0, 0, features.rows())];
        let mut centroids = Matrix::with_width(width);
        centroids.push(&T::mean(features.iter(), width));

        // Nodes still to be split, with the training rows under them.
        let mut frontier: Vec<(NodeId, Vec<usize>)> = vec![(0, (0..features.rows()).collect())];

        for depth in 0..params.levels {
            if frontier.is_empty() {
                break;
            }
            debug!(level = depth + 1, splits = frontier.len(), "k-means level");

            // Each split has its own seed, so the level is order independent.
            let splits: Vec<Vec<Cluster<T>>> = frontier
                .par_iter()
                .map(|(id, members)| Self::split(features, members, params, *id))
                .collect();

            let mut next = Vec::new();
            for ((parent, _), clusters) in frontier.iter().zip(splits) {
                // All rows identical: nothing to split, the node stays a leaf.
                if clusters.len() < 2 && *parent != 0 {
                    continue;
                }
                for cluster in clusters {
                    let id = nodes.len() as NodeId;
                    nodes.push(Node::new(*parent, depth + 1, cluster.members.len()));
                    nodes[*parent as usize].children.push(id);
                    centroids.push(&cluster.centroid);
                    if depth + 1 < params.levels && cluster.members.len() > 1 {
                        next.push((id, cluster.members));
                    }
                }
            }
            frontier = next;
        }

        let mut words = Vec::new();
        for (i, node) in nodes.iter_mut().enumerate() {
            if node.is_leaf() {
                node.word = Some(words.len() as WordId);
                words.push(i as NodeId);
            }
        }

        let kind = T::wrap(Matrix::with_width(width)).kind();
        let mut tree = Self {
            kind,
            metric: kind.metric(),
            nodes,
            centroids: T::wrap(centroids),
            words,
            levels: params.levels,
        };
        tree.set_weights(params.weighting, features.rows());
        tree
    }

    fn set_weights(&mut self, weighting: WeightingType, n: usize) {
        let n = n as f64;
        for &leaf in &self.words {
            let node = &mut self.nodes[leaf as usize];
            node.weight = match weighting {
                WeightingType::TfIdf | WeightingType::Idf => {
                    if node.cluster_size == 0 {
                        0.
                    } else {
                        (n / node.cluster_size as f64).ln()
                    }
                }
                WeightingType::Tf | WeightingType::Binary => 1.,
            };
        }
    }

    /// One k-means step over `members`. Clusters with at most `k` distinct
    /// rows get one child per distinct row.
    fn split<T: Component>(
        features: &Matrix<T>,
        members: &[usize],
        params: &VocabParams,
        node: NodeId,
    ) -> Vec<Cluster<T>> {
        if let Some(groups) = Self::distinct_groups(features, members, params.k) {
            trace!(node, rows = members.len(), children = groups.len(), "small cluster");
            return groups
                .into_iter()
                .map(|members| Cluster {
                    centroid: features.row(members[0]).to_vec(),
                    members,
                })
                .collect();
        }

        let k = params.k;
        let width = features.width();
        let mut rng = StdRng::seed_from_u64(params.seed ^ (node as u64).wrapping_mul(SEED_MIX));
        let mut centers = Self::initialize_clusters(features, members, k, &mut rng);

        let mut assignment = vec![usize::MAX; members.len()];
        let mut iterations = 0;
        while iterations < params.max_iterations {
            iterations += 1;
            let mut changed = false;
            for (slot, &i) in assignment.iter_mut().zip(members) {
                let best = nearest(&centers, features.row(i));
                if *slot != best {
                    *slot = best;
                    changed = true;
                }
            }
            if !changed {
                break; // converged
            }

            let groups = group_by_assignment(members, &assignment, centers.len());
            for (center, group) in centers.iter_mut().zip(&groups) {
                // An emptied cluster keeps its previous center.
                if !group.is_empty() {
                    *center = T::mean(group.iter().map(|&i| features.row(i)), width);
                }
            }
        }
        trace!(node, rows = members.len(), iterations, "k-means step");

        group_by_assignment(members, &assignment, centers.len())
            .into_iter()
            .zip(centers)
            .filter(|(group, _)| !group.is_empty())
            .map(|(members, centroid)| Cluster { centroid, members })
            .collect()
    }

    /// Group identical rows. `None` once more than `k` distinct rows are seen.
    fn distinct_groups<T: Component>(
        features: &Matrix<T>,
        members: &[usize],
        k: usize,
    ) -> Option<Vec<Vec<usize>>> {
        let mut groups: Vec<Vec<usize>> = Vec::new();
        for &i in members {
            let row = features.row(i);
            let full = groups.len() == k;
            match groups.iter_mut().find(|g| features.row(g[0]) == row) {
                Some(g) => g.push(i),
                None if full => return None,
                None => groups.push(vec![i]),
            }
        }
        Some(groups)
    }

    /// k-means++ seeding from a deterministic rng. Requires more than `k`
    /// distinct rows, so every chosen center is distinct.
    fn initialize_clusters<T: Component>(
        features: &Matrix<T>,
        members: &[usize],
        k: usize,
        rng: &mut StdRng,
    ) -> Vec<Vec<T>> {
        let mut centers: Vec<Vec<T>> = Vec::with_capacity(k);
        let first = members[rng.gen_range(0..members.len())];
        centers.push(features.row(first).to_vec());

        let mut dist: Vec<f64> = members
            .iter()
            .map(|&i| {
                let d = T::distance(features.row(i), &centers[0]);
                d * d
            })
            .collect();

        while centers.len() < k {
            let total: f64 = dist.iter().sum();
            if total <= 0. {
                break;
            }
            let mut target = rng.gen::<f64>() * total;
            let mut chosen = None;
            for (j, &d) in dist.iter().enumerate() {
                if d <= 0. {
                    continue;
                }
                chosen = Some(j);
                if target < d {
                    break;
                }
                target -= d;
            }
            let j = match chosen {
                Some(j) => j,
                None => break,
            };
            let center = features.row(members[j]).to_vec();
            for (dj, &i) in dist.iter_mut().zip(members) {
                let d = T::distance(features.row(i), &center);
                *dj = dj.min(d * d);
            }
            centers.push(center);
        }
        centers
    }

    fn check_kind(&self, found: DescKind) -> BowResult<()> {
        if found != self.kind {
            return Err(BowErr::IncompatibleDescriptor {
                expected: self.kind,
                found,
            });
        }
        Ok(())
    }

    fn centroids<T: Component>(&self) -> BowResult<&Matrix<T>> {
        let found = T::wrap(Matrix::with_width(0)).kind();
        T::matrix(&self.centroids).ok_or(BowErr::IncompatibleDescriptor {
            expected: self.kind,
            found,
        })
    }

    /// Greedy descent from the root to a leaf, recording the node path.
    fn descend<T: Component>(&self, centroids: &Matrix<T>, row: &[T], path: &mut Path) -> NodeId {
        path.clear();
        let mut id: NodeId = 0;
        path.push(id);
        loop {
            let node = &self.nodes[id as usize];
            let mut best: Option<(f64, NodeId)> = None;
            for &child in &node.children {
                let d = T::distance(row, centroids.row(child as usize));
                if best.map_or(true, |(bd, _)| d < bd) {
                    best = Some((d, child));
                }
            }
            match best {
                Some((_, child)) => {
                    id = child;
                    path.push(id);
                }
                None => return id,
            }
        }
    }

    /// Descent of a single row through the stored metric.
    fn descend_ref(&self, desc: DescRef<'_>) -> NodeId {
        let mut id: NodeId = 0;
        loop {
            let mut best: Option<(f64, NodeId)> = None;
            for &child in &self.nodes[id as usize].children {
                let d = match self.centroids.get(child as usize) {
                    Some(c) => self.metric.distance(desc, c),
                    None => continue,
                };
                if best.map_or(true, |(bd, _)| d < bd) {
                    best = Some((d, child));
                }
            }
            match best {
                Some((_, child)) => id = child,
                None => return id,
            }
        }
    }

    /// Leaf reached by every row. With a direct index request, also records
    /// each row under the path node `levels_up` above its leaf.
    fn descend_all<T: Component>(
        &self,
        features: &Matrix<T>,
        mut direct_idx: Option<(usize, &mut FeatureVector)>,
    ) -> BowResult<Vec<NodeId>> {
        let centroids = self.centroids::<T>()?;
        let mut path = Path::new();
        let mut leaves = Vec::with_capacity(features.rows());
        for (i, row) in features.iter().enumerate() {
            let leaf = self.descend(centroids, row, &mut path);
            if let Some((levels_up, fv)) = direct_idx.as_mut() {
                let depth = self.levels.saturating_sub(*levels_up).min(path.len() - 1);
                fv.push(path[depth], i);
            }
            leaves.push(leaf);
        }
        Ok(leaves)
    }

    fn word_at(&self, leaf: NodeId) -> WordId {
        // Descent always ends on a leaf, and every leaf carries a word.
        self.nodes[leaf as usize].word.unwrap_or_default()
    }

    /// Structural checks on a deserialized tree.
    #[cfg(feature = "bincode")]
    fn validate(&self, levels: usize) -> Result<(), String> {
        if self.levels != levels {
            return Err(format!(
                "tree depth {} does not match parameters ({})",
                self.levels, levels
            ));
        }
        if self.centroids.kind() != self.kind {
            return Err(format!(
                "centroids are {}, tree declares {}",
                self.centroids.kind(),
                self.kind
            ));
        }
        if self.metric != self.kind.metric() {
            return Err(format!("metric {:?} does not fit {}", self.metric, self.kind));
        }
        if self.nodes.is_empty() || self.centroids.len() != self.nodes.len() {
            return Err(format!(
                "{} nodes but {} centroids",
                self.nodes.len(),
                self.centroids.len()
            ));
        }
        let mut leaves = 0;
        for (id, node) in self.nodes.iter().enumerate() {
            if node.depth > self.levels {
                return Err(format!("node {} deeper than {} levels", id, self.levels));
            }
            for &c in &node.children {
                let child = self
                    .nodes
                    .get(c as usize)
                    .ok_or_else(|| format!("node {} has missing child {}", id, c))?;
                if c as usize <= id
                    || child.parent as usize != id
                    || child.depth != node.depth + 1
                {
                    return Err(format!("node {} has inconsistent child {}", id, c));
                }
            }
            match (node.is_leaf(), node.word) {
                (true, Some(w)) if self.words.get(w as usize) == Some(&(id as NodeId)) => {
                    leaves += 1
                }
                (false, None) => {}
                _ => return Err(format!("node {} has an inconsistent word id", id)),
            }
        }
        if leaves != self.words.len() {
            return Err(format!(
                "{} leaves but {} words",
                leaves,
                self.words.len()
            ));
        }
        Ok(())
    }
}

const SEED_MIX: u64 = 0x9E37_79B9_7F4A_7C15;

#[inline]
fn nearest<T: Component>(centers: &[Vec<T>], row: &[T]) -> usize {
    let mut best: (usize, f64) = (0, f64::INFINITY);
    for (j, c) in centers.iter().enumerate() {
        let d = T::distance(row, c);
        if d < best.1 {
            best = (j, d);
        }
    }
    best.0
}

fn group_by_assignment(members: &[usize], assignment: &[usize], k: usize) -> Vec<Vec<usize>> {
    let mut groups = vec![Vec::new(); k];
    for (&i, &a) in members.iter().zip(assignment) {
        groups[a].push(i);
    }
    groups
}

impl fmt::Debug for Vocabulary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let tree = match &self.tree {
            Some(t) => t,
            None => {
                return f
                    .debug_struct("Vocabulary")
                    .field("Params", &self.params)
                    .field("Built", &false)
                    .finish()
            }
        };
        let clust_sizes: Vec<usize> = tree
            .words
            .iter()
            .map(|&n| tree.nodes[n as usize].cluster_size)
            .collect();
        let sum = clust_sizes.iter().sum::<usize>();
        f.debug_struct("Vocabulary")
            .field("Word/Leaf Nodes", &tree.words.len())
            .field("Other Nodes", &(tree.nodes.len() - tree.words.len()))
            .field("Levels", &self.params.levels)
            .field("Branching Factor", &self.params.k)
            .field("Descriptors", &tree.kind)
            .field("Weighting", &self.params.weighting)
            .field("Scoring", &self.params.scoring)
            .field("Total Training Features", &sum)
            .field("Min Word Cluster Size", &clust_sizes.iter().min().copied().unwrap_or(0))
            .field("Max Word Cluster Size", &clust_sizes.iter().max().copied().unwrap_or(0))
            .field("Mean Word Cluster Size", &(sum / clust_sizes.len().max(1)))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Four tight, well separated clusters of 2-D points, in two far apart
    /// pairs so the two-level split is unambiguous.
    fn four_clusters() -> (Descriptors, Vec<[f32; 2]>) {
        let centers = [[0f32, 0.], [0., 10.], [1000., 0.], [1000., 10.]];
        let offsets = [[0f32, 0.], [0.1, 0.], [0., 0.1], [-0.1, 0.], [0., -0.1]];
        let mut rows = Vec::new();
        for c in centers.iter() {
            for o in offsets.iter() {
                rows.push(vec![c[0] + o[0], c[1] + o[1]]);
            }
        }
        (Descriptors::from_float_rows(&rows).unwrap(), centers.to_vec())
    }

    fn point(p: [f32; 2]) -> Descriptors {
        Descriptors::from_float_rows(&[p.to_vec()]).unwrap()
    }

    fn random_binary(n: usize, seed: u64) -> Descriptors {
        let mut rng = StdRng::seed_from_u64(seed);
        let rows: Vec<[u8; 32]> = (0..n).map(|_| rng.gen()).collect();
        Descriptors::from_binary_rows(&rows).unwrap()
    }

    #[test]
    fn well_separated_clusters_get_distinct_words() {
        let (train, centers) = four_clusters();
        let voc = Vocabulary::create(&train, VocabParams::new(2, 2)).unwrap();
        assert_eq!(voc.size(), 4);

        let words: Vec<WordId> = centers
            .iter()
            .map(|c| voc.word_of(DescRef::Float(&c[..])).unwrap())
            .collect();
        let mut distinct = words.clone();
        distinct.sort_unstable();
        distinct.dedup();
        assert_eq!(distinct.len(), 4, "{:?}", words);

        // Every member of a cluster lands on the cluster's word.
        for (c, &w) in centers.iter().zip(&words) {
            for o in [[0.5f32, 0.5], [-0.5, 0.8], [1., -1.5]] {
                let p = [c[0] + o[0], c[1] + o[1]];
                assert_eq!(voc.word_of(DescRef::Float(&p[..])).unwrap(), w);
            }
        }
    }

    #[test]
    fn tf_idf_weights() {
        let (train, _) = four_clusters();
        let voc = Vocabulary::create(&train, VocabParams::new(2, 2)).unwrap();
        // Each word holds 5 of 20 training descriptors.
        for w in 0..4 {
            assert!((voc.word_weight(w).unwrap() - (4f64).ln()).abs() < 1e-12);
        }
        let tf = Vocabulary::create(&train, VocabParams::new(2, 2).weighting(WeightingType::Tf))
            .unwrap();
        assert_eq!(tf.word_weight(0), Some(1.));
        assert_eq!(tf.word_weight(4), None);
    }

    #[test]
    fn transform_is_normalized_and_sparse() {
        let (train, centers) = four_clusters();
        let voc = Vocabulary::create(&train, VocabParams::new(2, 2)).unwrap();
        let rows = vec![centers[0].to_vec(), centers[0].to_vec(), centers[3].to_vec()];
        let bow = voc
            .transform(&Descriptors::from_float_rows(&rows).unwrap())
            .unwrap();
        assert_eq!(bow.len(), 2);
        assert!((bow.l1_norm() - 1.).abs() < 1e-12);
        let w0 = voc.word_of(DescRef::Float(&centers[0][..])).unwrap();
        assert!((bow.get(w0) - 2. / 3.).abs() < 1e-12);
    }

    #[test]
    fn binary_weighting_counts_presence_only() {
        let (train, centers) = four_clusters();
        let params = VocabParams::new(2, 2).weighting(WeightingType::Binary);
        let voc = Vocabulary::create(&train, params).unwrap();
        let rows = vec![centers[1].to_vec(), centers[1].to_vec(), centers[2].to_vec()];
        let bow = voc
            .transform(&Descriptors::from_float_rows(&rows).unwrap())
            .unwrap();
        assert_eq!(bow.iter().map(|(_, v)| v).collect::<Vec<_>>(), vec![1., 1.]);
    }

    #[test]
    fn idf_ignores_repeated_features() {
        let (train, centers) = four_clusters();
        let params = VocabParams::new(2, 2).weighting(WeightingType::Idf);
        let voc = Vocabulary::create(&train, params).unwrap();
        let rows = vec![
            centers[0].to_vec(),
            centers[0].to_vec(),
            centers[0].to_vec(),
            centers[3].to_vec(),
        ];
        let rows = Descriptors::from_float_rows(&rows).unwrap();
        let bow = voc.transform(&rows).unwrap();
        let w0 = voc.word_of(DescRef::Float(&centers[0][..])).unwrap();
        let w3 = voc.word_of(DescRef::Float(&centers[3][..])).unwrap();
        // Equal idf weights, so presence alone splits the mass evenly.
        assert!((bow.get(w0) - 0.5).abs() < 1e-12);
        assert!((bow.get(w3) - 0.5).abs() < 1e-12);

        let tf_idf = Vocabulary::create(&train, VocabParams::new(2, 2)).unwrap();
        assert!((tf_idf.transform(&rows).unwrap().get(w0) - 0.75).abs() < 1e-12);
    }

    #[test]
    fn empty_input_gives_empty_bow() {
        let (train, _) = four_clusters();
        let voc = Vocabulary::create(&train, VocabParams::new(2, 2)).unwrap();
        let bow = voc.transform(&Descriptors::empty(DescKind::Float { dims: 2 })).unwrap();
        assert!(bow.is_empty());
    }

    #[test]
    fn rejects_incompatible_descriptors() {
        let (train, _) = four_clusters();
        let voc = Vocabulary::create(&train, VocabParams::new(2, 2)).unwrap();
        let wrong_len = Descriptors::float(3, vec![0.; 6]).unwrap();
        assert!(matches!(
            voc.transform(&wrong_len),
            Err(BowErr::IncompatibleDescriptor { .. })
        ));
        let wrong_kind = random_binary(3, 1);
        assert!(matches!(
            voc.transform(&wrong_kind),
            Err(BowErr::IncompatibleDescriptor { .. })
        ));
        assert!(matches!(
            voc.word_of(DescRef::Float(&[1., 2., 3.])),
            Err(BowErr::IncompatibleDescriptor { .. })
        ));
    }

    #[test]
    fn unbuilt_and_cleared() {
        let mut voc = Vocabulary::new(VocabParams::default());
        let bow = BoW::new();
        assert!(matches!(
            voc.transform(&random_binary(1, 0)),
            Err(BowErr::VocabularyNotBuilt)
        ));
        assert!(matches!(voc.score(&bow, &bow), Err(BowErr::VocabularyNotBuilt)));

        voc.build(&random_binary(50, 0)).unwrap();
        assert!(voc.size() > 0);
        voc.clear();
        assert_eq!(voc.size(), 0);
        assert!(matches!(
            voc.transform(&random_binary(1, 0)),
            Err(BowErr::VocabularyNotBuilt)
        ));
    }

    #[test]
    fn build_errors() {
        let empty = Descriptors::empty(DescKind::Binary { bytes: 32 });
        assert!(matches!(
            Vocabulary::create(&empty, VocabParams::default()),
            Err(BowErr::EmptyTrainingSet)
        ));
        assert!(matches!(
            Vocabulary::create(&random_binary(5, 0), VocabParams::new(1, 3)),
            Err(BowErr::InvalidParams(_))
        ));
        assert!(matches!(
            Vocabulary::create(&random_binary(5, 0), VocabParams::new(4, 0)),
            Err(BowErr::InvalidParams(_))
        ));
    }

    #[test]
    fn build_is_deterministic() {
        let train = random_binary(400, 7);
        let params = VocabParams::new(4, 3);
        let a = Vocabulary::create(&train, params.clone()).unwrap();
        let b = Vocabulary::create(&train, params).unwrap();
        assert!(a == b);

        let query = random_binary(30, 8);
        assert_eq!(a.transform(&query).unwrap(), b.transform(&query).unwrap());
    }

    #[test]
    fn tree_shape_within_bounds() {
        let voc = Vocabulary::create(&random_binary(500, 3), VocabParams::new(3, 3)).unwrap();
        assert!(voc.size() <= 27);
        assert!(voc.size() > 3);
        let tree = voc.tree.as_ref().unwrap();
        for node in &tree.nodes {
            assert!(node.children.len() <= 3);
            assert!(node.depth <= 3);
        }
        let total: usize = tree.words.iter().map(|&n| tree.nodes[n as usize].cluster_size).sum();
        assert_eq!(total, 500);
    }

    #[test]
    fn small_clusters_branch_per_distinct_row() {
        let rows = vec![vec![1f32, 1.], vec![1., 1.], vec![5., 5.]];
        let train = Descriptors::from_float_rows(&rows).unwrap();
        let voc = Vocabulary::create(&train, VocabParams::new(4, 3)).unwrap();
        // Root gets one child per distinct row; both are leaves.
        assert_eq!(voc.size(), 2);
        assert_eq!(voc.num_nodes(), 3);
    }

    #[test]
    fn distinct_groups_stop_past_k() {
        let rows = vec![vec![1f32], vec![2.], vec![1.], vec![3.], vec![2.]];
        let m = match Descriptors::from_float_rows(&rows).unwrap() {
            Descriptors::Float(m) => m,
            Descriptors::Binary(_) => unreachable!(),
        };
        let all: Vec<usize> = (0..5).collect();
        assert_eq!(
            Tree::distinct_groups(&m, &all, 3),
            Some(vec![vec![0, 2], vec![1, 4], vec![3]])
        );
        assert_eq!(Tree::distinct_groups(&m, &all, 2), None);
        assert_eq!(Tree::distinct_groups(&m, &[0, 2], 1), Some(vec![vec![0, 2]]));
    }

    #[test]
    fn direct_index_covers_every_feature() {
        let train = random_binary(300, 11);
        let voc = Vocabulary::create(&train, VocabParams::new(3, 3)).unwrap();
        let tree = voc.tree.as_ref().unwrap();
        let query = random_binary(40, 12);

        for up in [0usize, 1, 2, 5] {
            let (bow, fv) = voc.transform_with_direct_idx(&query, up).unwrap();
            assert_eq!(bow, voc.transform(&query).unwrap());
            assert_eq!(fv.num_features(), 40);

            // Each feature sits under the ancestor of its leaf at depth
            // `levels - up`, or under the leaf itself when that is shallower.
            for (node, feats) in fv.iter() {
                for &i in feats {
                    let word = voc.word_of(query.get(i).unwrap()).unwrap();
                    let leaf_depth = tree.nodes[tree.words[word as usize] as usize].depth;
                    let target = 3usize.saturating_sub(up).min(leaf_depth);
                    assert_eq!(voc.parent_node(word, leaf_depth - target), Some(node));
                }
            }
        }
    }

    #[test]
    fn word_of_agrees_with_transform() {
        let params = VocabParams::new(3, 3).weighting(WeightingType::Binary);
        let voc = Vocabulary::create(&random_binary(300, 5), params).unwrap();
        let query = random_binary(30, 6);
        let bow = voc.transform(&query).unwrap();
        let mut words: Vec<WordId> = (0..30)
            .map(|i| voc.word_of(query.get(i).unwrap()).unwrap())
            .collect();
        words.sort_unstable();
        words.dedup();
        assert_eq!(bow.iter().map(|(w, _)| w).collect::<Vec<_>>(), words);
    }

    #[test]
    fn score_delegates_to_scoring_type() {
        let (train, centers) = four_clusters();
        let params = VocabParams::new(2, 2).scoring(ScoringType::Bhattacharyya);
        let voc = Vocabulary::create(&train, params).unwrap();
        let bow = voc.transform(&point(centers[2])).unwrap();
        assert!((voc.score(&bow, &bow).unwrap() - 1.).abs() < 1e-12);
    }

    #[cfg(feature = "bincode")]
    #[test]
    fn save_load_round_trip() {
        let train = random_binary(300, 21);
        let voc = Vocabulary::create(&train, VocabParams::new(3, 3)).unwrap();
        let mut buf = Vec::new();
        voc.write_to(&mut buf).unwrap();
        let loaded = Vocabulary::read_from(buf.as_slice()).unwrap();
        assert!(voc == loaded);

        let query = random_binary(25, 22);
        assert_eq!(voc.transform(&query).unwrap(), loaded.transform(&query).unwrap());
    }

    #[cfg(feature = "bincode")]
    #[test]
    fn load_rejects_garbage_and_wrong_kind() {
        assert!(matches!(
            Vocabulary::read_from(&b"definitely not a vocabulary"[..]),
            Err(BowErr::CorruptOrIncompatibleVocabulary(_))
        ));

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("voc.bin");
        let voc = Vocabulary::create(&random_binary(100, 2), VocabParams::new(3, 2)).unwrap();
        voc.save(&path).unwrap();
        assert!(Vocabulary::load_expecting(&path, DescKind::Binary { bytes: 32 }).is_ok());
        assert!(matches!(
            Vocabulary::load_expecting(&path, DescKind::Float { dims: 32 }),
            Err(BowErr::CorruptOrIncompatibleVocabulary(_))
        ));
    }

    #[cfg(feature = "bincode")]
    fn encode(magic: [u8; 4], version: u32, params: &VocabParams, tree: &Tree) -> Vec<u8> {
        let artifact = VocabArtifactRef {
            magic,
            version,
            params,
            tree,
        };
        bincode::serialize(&artifact).unwrap()
    }

    #[cfg(feature = "bincode")]
    fn assert_corrupt(bytes: Vec<u8>, reason: &str) {
        match Vocabulary::read_from(bytes.as_slice()) {
            Err(BowErr::CorruptOrIncompatibleVocabulary(msg)) => {
                assert!(msg.contains(reason), "{:?} lacks {:?}", msg, reason)
            }
            other => panic!("expected corrupt vocabulary, got {:?}", other.map(|_| ())),
        }
    }

    #[cfg(feature = "bincode")]
    #[test]
    fn load_rejects_tampered_artifacts() {
        let (train, _) = four_clusters();
        let voc = Vocabulary::create(&train, VocabParams::new(2, 2)).unwrap();
        let params = voc.params().clone();
        let tree = voc.tree.as_ref().unwrap();

        let valid = encode(VOCAB_MAGIC, VOCAB_VERSION, &params, tree);
        assert!(Vocabulary::read_from(valid.as_slice()).unwrap() == voc);

        assert_corrupt(encode(*b"VBDB", VOCAB_VERSION, &params, tree), "not a vocabulary");
        assert_corrupt(encode(VOCAB_MAGIC, VOCAB_VERSION + 1, &params, tree), "version");
        assert_corrupt(
            encode(VOCAB_MAGIC, VOCAB_VERSION, &VocabParams::new(2, 3), tree),
            "does not match parameters",
        );
        assert_corrupt(
            encode(VOCAB_MAGIC, VOCAB_VERSION, &VocabParams::new(1, 2), tree),
            "branching factor",
        );

        let mut fewer_words = tree.clone();
        fewer_words.words.pop();
        assert_corrupt(
            encode(VOCAB_MAGIC, VOCAB_VERSION, &params, &fewer_words),
            "inconsistent word id",
        );

        let mut cycle = tree.clone();
        cycle.nodes[1].children.push(0);
        assert_corrupt(
            encode(VOCAB_MAGIC, VOCAB_VERSION, &params, &cycle),
            "inconsistent child",
        );

        let mut dangling = tree.clone();
        dangling.nodes[0].children.push(99);
        assert_corrupt(
            encode(VOCAB_MAGIC, VOCAB_VERSION, &params, &dangling),
            "missing child",
        );

        let mut short = tree.clone();
        short.centroids = Descriptors::empty(DescKind::Float { dims: 2 });
        assert_corrupt(encode(VOCAB_MAGIC, VOCAB_VERSION, &params, &short), "centroids");
    }

    #[cfg(feature = "bincode")]
    #[test]
    fn save_unbuilt_fails() {
        let voc = Vocabulary::new(VocabParams::default());
        assert!(matches!(
            voc.write_to(Vec::new()),
            Err(BowErr::VocabularyNotBuilt)
        ));
    }
}
