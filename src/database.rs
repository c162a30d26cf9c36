use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use tracing::debug;
#[cfg(feature = "bincode")]
use tracing::info;

use crate::*;

/// One ranked match returned by [`Database::query`].
#[derive(Debug, Clone, PartialEq)]
pub struct QueryResult {
    pub entry_id: EntryId,
    /// Similarity with the query; higher is better. Distance scorings
    /// (chi-square, KL) are reported negated.
    pub score: f64,
    /// Number of words shared with the query.
    pub n_words: usize,
    /// Sum of the query's weights over the shared words.
    pub sum_common_vi: f64,
    /// Sum of the entry's weights over the shared words.
    pub sum_common_wi: f64,
    /// Raw chi-square statistic, when the database scores with chi-square.
    pub chi_score: Option<f64>,
    /// Raw Bhattacharyya coefficient, when the database scores with it.
    pub bhat_score: Option<f64>,
}

/// Image database over a shared [`Vocabulary`].
///
/// Entries are append only: ids start at 0, grow by one per add and are
/// never reused. The inverted index maps every word to the entries that
/// contain it, so a query only scores entries sharing at least one word
/// with it. With the direct index enabled, each entry also keeps the
/// [`FeatureVector`] of its descriptors.
///
/// All methods take `&self`; adds are serialized behind a write lock and
/// become visible to queries as a whole.
pub struct Database {
    inner: RwLock<Inner>,
}

#[derive(Default)]
struct Inner {
    voc: Option<Arc<Vocabulary>>,
    use_di: bool,
    di_levels: usize,
    bows: Vec<BoW>,
    /// Word id -> postings, ascending entry id.
    inverted: Vec<Vec<Posting>>,
    /// Entry id -> feature vector. Empty when added without direct index.
    direct: Vec<FeatureVector>,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq)]
struct Posting {
    entry: EntryId,
    weight: f64,
}

/// Shared words between the query and one candidate.
#[derive(Default)]
struct Common {
    n_words: usize,
    sum_vi: f64,
    sum_wi: f64,
}

impl Default for Database {
    fn default() -> Self {
        Self::new()
    }
}

impl Database {
    /// An empty database without vocabulary.
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Inner::default()),
        }
    }

    pub fn with_vocabulary(voc: Arc<Vocabulary>, use_di: bool, di_levels: usize) -> Self {
        let db = Self::new();
        db.set_vocabulary(voc, use_di, di_levels);
        db
    }

    /// Set (or swap) the vocabulary used by subsequent adds and queries.
    /// Already indexed entries are kept as they are.
    ///
    /// With `use_di`, every add records a direct index at `di_levels`
    /// levels up from the leaves (see [`Vocabulary::transform_with_direct_idx`]).
    pub fn set_vocabulary(&self, voc: Arc<Vocabulary>, use_di: bool, di_levels: usize) {
        let mut inner = self.inner.write();
        debug!(words = voc.size(), use_di, di_levels, "database vocabulary set");
        inner.voc = Some(voc);
        inner.use_di = use_di;
        inner.di_levels = di_levels;
    }

    pub fn vocabulary(&self) -> Option<Arc<Vocabulary>> {
        self.inner.read().voc.clone()
    }

    pub fn uses_direct_index(&self) -> bool {
        self.inner.read().use_di
    }

    pub fn direct_index_levels(&self) -> usize {
        self.inner.read().di_levels
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.inner.read().bows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Transform `features` and index them as a new entry.
    pub fn add(&self, features: &Descriptors) -> BowResult<EntryId> {
        self.add_and_get_bow(features).map(|(id, _)| id)
    }

    /// Like [`add`](Self::add), also returning the bow vector that was indexed.
    pub fn add_and_get_bow(&self, features: &Descriptors) -> BowResult<(EntryId, BoW)> {
        let (voc, use_di, di_levels) = {
            let inner = self.inner.read();
            let voc = inner.voc.clone().ok_or(BowErr::NoVocabulary)?;
            (voc, inner.use_di, inner.di_levels)
        };
        // Transform outside the write lock so queries keep running meanwhile.
        let (bow, fv) = if use_di {
            voc.transform_with_direct_idx(features, di_levels)?
        } else {
            (voc.transform(features)?, FeatureVector::new())
        };
        let id = self.inner.write().insert(bow.clone(), fv);
        Ok((id, bow))
    }

    /// Index an already computed bow vector (and its feature vector, which
    /// may be empty). Every word must belong to the current vocabulary.
    pub fn add_bow(&self, bow: BoW, fv: FeatureVector) -> BowResult<EntryId> {
        let mut inner = self.inner.write();
        let words = inner.voc.as_ref().ok_or(BowErr::NoVocabulary)?.size();
        if !bow.is_canonical() {
            return Err(BowErr::MalformedBow(
                "words must be ascending with positive weights".into(),
            ));
        }
        if let Some((w, _)) = bow.iter().find(|&(w, _)| w as usize >= words) {
            return Err(BowErr::MalformedBow(format!(
                "word {} outside a vocabulary of {} words",
                w, words
            )));
        }
        Ok(inner.insert(bow, fv))
    }

    /// Rank the entries most similar to `features`.
    ///
    /// Only entries sharing a word with the query are scored. Entries with
    /// an id above `max_id` are skipped. Results are sorted by descending
    /// score, ties by ascending entry id, and cut at `max_results` unless
    /// it is 0.
    pub fn query(
        &self,
        features: &Descriptors,
        max_results: usize,
        max_id: Option<EntryId>,
    ) -> BowResult<Vec<QueryResult>> {
        let inner = self.inner.read();
        let voc = inner.voc.as_ref().ok_or(BowErr::NoVocabulary)?;
        let q = voc.transform(features)?;
        Ok(inner.rank(&q, voc.scoring(), max_results, max_id))
    }

    /// [`query`](Self::query) with an already computed bow vector.
    pub fn query_bow(
        &self,
        q: &BoW,
        max_results: usize,
        max_id: Option<EntryId>,
    ) -> BowResult<Vec<QueryResult>> {
        let inner = self.inner.read();
        let voc = inner.voc.as_ref().ok_or(BowErr::NoVocabulary)?;
        Ok(inner.rank(q, voc.scoring(), max_results, max_id))
    }

    /// Stored bow vector of `entry`.
    pub fn bow(&self, entry: EntryId) -> Option<BoW> {
        self.inner.read().bows.get(entry as usize).cloned()
    }

    /// Stored feature vector of `entry`.
    pub fn feature_vector(&self, entry: EntryId) -> Option<FeatureVector> {
        self.inner.read().direct.get(entry as usize).cloned()
    }

    /// Entries containing `word`, with the word's weight in each.
    pub fn word_entries(&self, word: WordId) -> Vec<(EntryId, f64)> {
        self.inner
            .read()
            .inverted
            .get(word as usize)
            .map(|p| p.iter().map(|p| (p.entry, p.weight)).collect())
            .unwrap_or_default()
    }
}

impl Inner {
    fn insert(&mut self, bow: BoW, fv: FeatureVector) -> EntryId {
        let id = self.bows.len() as EntryId;
        for (word, weight) in bow.iter() {
            let w = word as usize;
            if w >= self.inverted.len() {
                self.inverted.resize_with(w + 1, Vec::new);
            }
            self.inverted[w].push(Posting { entry: id, weight });
        }
        debug!(entry = id, words = bow.len(), features = fv.num_features(), "entry added");
        self.bows.push(bow);
        self.direct.push(fv);
        id
    }

    fn rank(
        &self,
        q: &BoW,
        scoring: ScoringType,
        max_results: usize,
        max_id: Option<EntryId>,
    ) -> Vec<QueryResult> {
        let mut candidates: BTreeMap<EntryId, Common> = BTreeMap::new();
        for (word, vi) in q.iter() {
            let postings = match self.inverted.get(word as usize) {
                Some(p) => p,
                None => continue,
            };
            // Postings ascend by entry id.
            for p in postings
                .iter()
                .take_while(|p| max_id.map_or(true, |m| p.entry <= m))
            {
                let c = candidates.entry(p.entry).or_default();
                c.n_words += 1;
                c.sum_vi += vi;
                c.sum_wi += p.weight;
            }
        }

        let n_candidates = candidates.len();
        let mut results: Vec<QueryResult> = candidates
            .into_iter()
            .map(|(entry_id, c)| {
                let raw = scoring.score(q, &self.bows[entry_id as usize]);
                QueryResult {
                    entry_id,
                    score: scoring.orient(raw),
                    n_words: c.n_words,
                    sum_common_vi: c.sum_vi,
                    sum_common_wi: c.sum_wi,
                    chi_score: (scoring == ScoringType::ChiSquare).then_some(raw),
                    bhat_score: (scoring == ScoringType::Bhattacharyya).then_some(raw),
                }
            })
            .collect();

        results.sort_by(|a, b| {
            b.score
                .total_cmp(&a.score)
                .then(a.entry_id.cmp(&b.entry_id))
        });
        if max_results > 0 {
            results.truncate(max_results);
        }
        debug!(
            query_words = q.len(),
            candidates = n_candidates,
            returned = results.len(),
            "database query"
        );
        results
    }
}

/// Persistence
#[cfg(feature = "bincode")]
impl Database {
    /// Save entries and indices. The vocabulary is not included; set it
    /// again after [`load`](Self::load).
    pub fn save<P: AsRef<std::path::Path>>(&self, file: P) -> BowResult<()> {
        self.save_generic(file, false)
    }

    /// Save entries, indices and the vocabulary itself.
    pub fn save_with_vocabulary<P: AsRef<std::path::Path>>(&self, file: P) -> BowResult<()> {
        self.save_generic(file, true)
    }

    /// Load a database. Its vocabulary is restored only if it was saved
    /// with [`save_with_vocabulary`](Self::save_with_vocabulary).
    pub fn load<P: AsRef<std::path::Path>>(file: P) -> BowResult<Self> {
        let file = std::fs::File::open(file)?;
        Self::read_from(std::io::BufReader::new(file))
    }

    pub fn write_to<W: std::io::Write>(&self, w: W, with_vocabulary: bool) -> BowResult<()> {
        let inner = self.inner.read();
        let vocabulary = match (&inner.voc, with_vocabulary) {
            (Some(voc), true) => {
                let mut buf = Vec::new();
                voc.write_to(&mut buf)?;
                Some(buf)
            }
            (None, true) => return Err(BowErr::NoVocabulary),
            (_, false) => None,
        };
        let artifact = DbArtifactRef {
            magic: DB_MAGIC,
            version: DB_VERSION,
            use_di: inner.use_di,
            di_levels: inner.di_levels,
            bows: &inner.bows,
            inverted: &inner.inverted,
            direct: &inner.direct,
            vocabulary,
        };
        bincode::serialize_into(w, &artifact)?;
        info!(
            entries = inner.bows.len(),
            with_vocabulary, "database saved"
        );
        Ok(())
    }

    pub fn read_from<R: std::io::Read>(r: R) -> BowResult<Self> {
        let corrupt = BowErr::CorruptDatabaseArtifact;
        let a: DbArtifact = bincode::deserialize_from(r).map_err(|e| corrupt(e.to_string()))?;
        if a.magic != DB_MAGIC {
            return Err(corrupt("not a database artifact".into()));
        }
        if a.version != DB_VERSION {
            return Err(corrupt(format!("unsupported format version {}", a.version)));
        }
        if a.direct.len() != a.bows.len() {
            return Err(corrupt(format!(
                "{} entries but {} direct index rows",
                a.bows.len(),
                a.direct.len()
            )));
        }
        if a.bows.len() > EntryId::MAX as usize {
            return Err(corrupt("too many entries".into()));
        }
        if let Some(i) = a.bows.iter().position(|b| !b.is_canonical()) {
            return Err(corrupt(format!("entry {} has a malformed bow vector", i)));
        }

        let voc = match a.vocabulary {
            Some(bytes) => Some(Arc::new(Vocabulary::read_from(bytes.as_slice())?)),
            None => None,
        };
        if let Some(voc) = &voc {
            if voc.size() < a.inverted.len() {
                return Err(corrupt(
                    "inverted index is larger than the embedded vocabulary".into(),
                ));
            }
        }
        let words = a.inverted.len();
        if a.bows.iter().flat_map(|b| b.iter()).any(|(w, _)| w as usize >= words) {
            return Err(corrupt(
                "entries reference words outside the inverted index".into(),
            ));
        }

        // The inverted index is fully determined by the entries; anything
        // else means the artifact is damaged.
        let mut inner = Inner {
            voc,
            use_di: a.use_di,
            di_levels: a.di_levels,
            ..Inner::default()
        };
        for (bow, fv) in a.bows.into_iter().zip(a.direct) {
            inner.insert(bow, fv);
        }
        if inner.inverted != a.inverted {
            return Err(corrupt("inverted index does not match entries".into()));
        }
        info!(entries = inner.bows.len(), "database loaded");
        Ok(Self {
            inner: RwLock::new(inner),
        })
    }

    fn save_generic<P: AsRef<std::path::Path>>(
        &self,
        file: P,
        with_vocabulary: bool,
    ) -> BowResult<()> {
        let file = std::fs::File::create(file)?;
        let mut w = std::io::BufWriter::new(file);
        self.write_to(&mut w, with_vocabulary)?;
        std::io::Write::flush(&mut w)?;
        Ok(())
    }
}

#[cfg(feature = "bincode")]
const DB_MAGIC: [u8; 4] = *b"VBDB";
#[cfg(feature = "bincode")]
const DB_VERSION: u32 = 1;

#[cfg(feature = "bincode")]
#[derive(Serialize)]
struct DbArtifactRef<'a> {
    magic: [u8; 4],
    version: u32,
    use_di: bool,
    di_levels: usize,
    bows: &'a [BoW],
    inverted: &'a [Vec<Posting>],
    direct: &'a [FeatureVector],
    /// Serialized vocabulary artifact.
    vocabulary: Option<Vec<u8>>,
}

#[cfg(feature = "bincode")]
#[derive(Deserialize)]
struct DbArtifact {
    magic: [u8; 4],
    version: u32,
    use_di: bool,
    di_levels: usize,
    bows: Vec<BoW>,
    inverted: Vec<Vec<Posting>>,
    direct: Vec<FeatureVector>,
    vocabulary: Option<Vec<u8>>,
}

impl fmt::Debug for Database {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.read();
        f.debug_struct("Database")
            .field("Entries", &inner.bows.len())
            .field("Vocabulary Words", &inner.voc.as_ref().map(|v| v.size()))
            .field("Indexed Words", &inner.inverted.iter().filter(|p| !p.is_empty()).count())
            .field("Direct Index", &inner.use_di)
            .field("Direct Index Levels", &inner.di_levels)
            .finish()
    }
}
